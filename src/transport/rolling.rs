// Rolling window of the most recent samples of one inlet
//
// Inlets append everything that arrives and hand out the last
// `window_seconds` on every pull that saw at least one new sample.

use super::select_rows;
use crate::types::SampleWindow;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct RollingWindow {
    timestamps: VecDeque<f64>,
    /// One entry per timestamp, all channels of the source
    frames: VecDeque<Vec<f64>>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timestamp: f64, frame: Vec<f64>) {
        self.timestamps.push_back(timestamp);
        self.frames.push_back(frame);
    }

    /// Drop everything older than the last `window_seconds`.
    ///
    /// With a known rate the window holds `ceil(window_seconds * rate)`
    /// samples; irregular sources are trimmed by timestamp instead.
    pub fn trim(&mut self, window_seconds: f64, sampling_rate: Option<f64>) {
        match sampling_rate.filter(|rate| *rate > 0.0) {
            Some(rate) => {
                let keep = (window_seconds * rate).ceil().max(1.0) as usize;
                while self.timestamps.len() > keep {
                    self.timestamps.pop_front();
                    self.frames.pop_front();
                }
            }
            None => {
                let Some(&newest) = self.timestamps.back() else {
                    return;
                };
                while self
                    .timestamps
                    .front()
                    .is_some_and(|&oldest| oldest <= newest - window_seconds)
                {
                    self.timestamps.pop_front();
                    self.frames.pop_front();
                }
            }
        }
    }

    /// Copy of the buffered window over `channels`, channel-major
    pub fn snapshot(&self, all: &[String], channels: &[String]) -> SampleWindow {
        let picks = select_rows(all, channels);
        let samples = picks
            .iter()
            .map(|&ch| {
                self.frames
                    .iter()
                    .map(|frame| frame.get(ch).copied().unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();

        SampleWindow {
            timestamps: self.timestamps.iter().copied().collect(),
            samples,
            channel_names: picks.iter().map(|&ch| all[ch].clone()).collect(),
        }
    }
}
