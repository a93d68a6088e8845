//! Raw scanline layout and color line realignment.
//!
//! The sensor delivers channel planes one after the other. In color the
//! channels are also read at different head positions, so each raw line
//! mixes channels belonging to different output rows: channel `c` of raw
//! line `r` belongs to output row `r + lag(c) - 2 * delta`.

use std::collections::VecDeque;

use crate::model::SensorLayout;

/// Sub-pixel shift of each channel inside a duplex segment (R, G, B).
const DUPLEX_SUBPIXEL: [usize; 3] = [0, 1, 0];
/// Per-plane x offset of the three-head sensor.
const THREE_HEAD_OFFSET: [usize; 3] = [0, 1, 2];

/// Byte layout of one raw scanline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFormat {
    pub layout: SensorLayout,
    pub channels: usize,
    /// Pixels per channel after descrambling.
    pub width: usize,
    /// Bytes per plane on the wire.
    pub plane_width: usize,
    pub planes: usize,
    pub delta: usize,
}

impl RawFormat {
    pub fn new(layout: SensorLayout, channels: usize, width: usize, delta: usize) -> Self {
        let plane_width = match layout {
            SensorLayout::Staggered => width,
            SensorLayout::ThreeHead if channels == 3 => width + 2,
            SensorLayout::ThreeHead => width,
            SensorLayout::Duplex => 2 * Self::segment_of(width),
        };
        Self {
            layout,
            channels,
            width,
            plane_width,
            planes: channels,
            delta: if channels == 3 { delta } else { 0 },
        }
    }

    fn segment_of(width: usize) -> usize {
        width.div_ceil(2) + 1
    }

    pub fn line_bytes(&self) -> usize {
        self.plane_width * self.planes
    }

    /// Raw lines buffered before the first complete output line.
    pub fn preload(&self) -> usize {
        2 * self.delta
    }

    /// Plane and line lag of an output channel.
    pub fn channel_source(&self, channel: usize) -> (usize, usize) {
        if self.channels == 1 {
            return (0, 0);
        }
        match self.layout {
            SensorLayout::Staggered | SensorLayout::Duplex => {
                [(2, 0), (1, self.delta), (0, 2 * self.delta)][channel]
            }
            SensorLayout::ThreeHead => {
                [(0, 2 * self.delta), (2, 0), (1, self.delta)][channel]
            }
        }
    }

    /// Byte index inside a raw line holding pixel `x` of `channel`.
    pub fn position(&self, channel: usize, x: usize) -> usize {
        let (plane, _) = self.channel_source(channel);
        let within = match self.layout {
            SensorLayout::Staggered => x,
            SensorLayout::ThreeHead if self.channels == 3 => x + THREE_HEAD_OFFSET[plane],
            SensorLayout::ThreeHead => x,
            SensorLayout::Duplex => {
                let sub = if self.channels == 3 {
                    DUPLEX_SUBPIXEL[channel]
                } else {
                    0
                };
                (x % 2) * Self::segment_of(self.width) + x / 2 + sub
            }
        };
        plane * self.plane_width + within
    }
}

/// Turns raw lines into interleaved lines at native resolution.
#[derive(Debug)]
pub struct Descrambler {
    format: RawFormat,
    history: VecDeque<Vec<u8>>,
    pushed: usize,
}

impl Descrambler {
    pub fn new(format: RawFormat) -> Self {
        Self {
            format,
            history: VecDeque::with_capacity(format.preload() + 1),
            pushed: 0,
        }
    }

    pub fn format(&self) -> &RawFormat {
        &self.format
    }

    /// Raw lines consumed so far.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// Feed one raw line. Returns the interleaved output line once enough
    /// history is buffered.
    pub fn push_line(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        debug_assert_eq!(raw.len(), self.format.line_bytes());
        if self.history.len() > self.format.preload() {
            self.history.pop_front();
        }
        self.history.push_back(raw.to_vec());
        self.pushed += 1;
        if self.pushed <= self.format.preload() {
            return None;
        }

        let newest = self.history.len() - 1;
        let channels = self.format.channels;
        let mut line = vec![0u8; self.format.width * channels];
        for channel in 0..channels {
            let (_, lag) = self.format.channel_source(channel);
            let source = &self.history[newest - lag];
            for x in 0..self.format.width {
                line[x * channels + channel] = source[self.format.position(channel, x)];
            }
        }
        Some(line)
    }
}

/// Build raw lines a sensor would deliver for the interleaved `rows`.
/// Rows outside the image are filled with the nearest edge row.
#[cfg(test)]
pub fn scramble_image(format: &RawFormat, rows: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let preload = format.preload();
    (0..rows.len() + preload)
        .map(|r| {
            let mut raw = vec![0u8; format.line_bytes()];
            for channel in 0..format.channels {
                let (_, lag) = format.channel_source(channel);
                let row = (r + lag).saturating_sub(preload).min(rows.len() - 1);
                for x in 0..format.width {
                    raw[format.position(channel, x)] = rows[row][x * format.channels + channel];
                }
            }
            raw
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: usize, height: usize, channels: usize) -> Vec<Vec<u8>> {
        (0..height)
            .map(|y| {
                (0..width * channels)
                    .map(|i| ((y * 31 + i * 7) % 251) as u8)
                    .collect()
            })
            .collect()
    }

    fn roundtrip(format: RawFormat, height: usize) {
        let image = test_image(format.width, height, format.channels);
        let mut descrambler = Descrambler::new(format);
        let output: Vec<Vec<u8>> = scramble_image(&format, &image)
            .iter()
            .filter_map(|raw| descrambler.push_line(raw))
            .collect();
        assert_eq!(output, image, "{:?}", format.layout);
    }

    #[test]
    fn test_plane_widths() {
        assert_eq!(RawFormat::new(SensorLayout::Staggered, 3, 100, 2).line_bytes(), 300);
        assert_eq!(RawFormat::new(SensorLayout::ThreeHead, 3, 100, 8).line_bytes(), 306);
        assert_eq!(RawFormat::new(SensorLayout::Duplex, 3, 101, 4).plane_width, 104);
        assert_eq!(RawFormat::new(SensorLayout::ThreeHead, 1, 100, 8).delta, 0);
    }

    #[test]
    fn test_color_realignment_per_layout() {
        roundtrip(RawFormat::new(SensorLayout::Staggered, 3, 17, 2), 12);
        roundtrip(RawFormat::new(SensorLayout::ThreeHead, 3, 17, 4), 12);
        roundtrip(RawFormat::new(SensorLayout::Duplex, 3, 17, 1), 12);
        roundtrip(RawFormat::new(SensorLayout::Duplex, 3, 16, 0), 5);
    }

    #[test]
    fn test_gray_has_no_preload() {
        let format = RawFormat::new(SensorLayout::Duplex, 1, 9, 4);
        assert_eq!(format.preload(), 0);
        roundtrip(format, 3);

        let mut descrambler = Descrambler::new(RawFormat::new(SensorLayout::Staggered, 1, 4, 0));
        assert_eq!(descrambler.push_line(&[1, 2, 3, 4]), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_first_line_after_preload() {
        let format = RawFormat::new(SensorLayout::Staggered, 3, 2, 1);
        let mut descrambler = Descrambler::new(format);
        assert!(descrambler.push_line(&[0; 6]).is_none());
        assert!(descrambler.push_line(&[0; 6]).is_none());
        assert!(descrambler.push_line(&[0; 6]).is_some());
        assert_eq!(descrambler.pushed(), 3);
    }
}
