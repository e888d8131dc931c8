// Reference cleaning
//
// Common-mode removal: the per-sample mean of the reference channels is
// subtracted from every channel, the reference channels included.

use crate::types::{ReferenceSet, SampleWindow};

/// Rows of `channel_names` that belong to the reference set, in row order
pub fn reference_rows(channel_names: &[String], reference: &ReferenceSet) -> Vec<usize> {
    channel_names
        .iter()
        .enumerate()
        .filter(|(_, name)| reference.contains(name))
        .map(|(row, _)| row)
        .collect()
}

/// Subtract the reference mean from every channel of `window`.
///
/// Reference names are resolved against the window's own channel list; names
/// it does not carry are ignored. With no resolvable reference the window is
/// returned untouched.
pub fn clean(window: SampleWindow, reference: &ReferenceSet) -> SampleWindow {
    let rows = reference_rows(&window.channel_names, reference);
    if rows.is_empty() {
        return window;
    }

    let n = window.num_samples();
    let mut mean = vec![0.0f64; n];
    for &row in &rows {
        for (acc, value) in mean.iter_mut().zip(&window.samples[row]) {
            *acc += value;
        }
    }
    let count = rows.len() as f64;
    mean.iter_mut().for_each(|acc| *acc /= count);

    let SampleWindow {
        timestamps,
        mut samples,
        channel_names,
    } = window;

    for channel in samples.iter_mut() {
        for (value, offset) in channel.iter_mut().zip(&mean) {
            *value -= offset;
        }
    }

    SampleWindow {
        timestamps,
        samples,
        channel_names,
    }
}
