//! Resolution conversion from native to requested dpi.

/// Output row a native row lands in.
pub fn row_map(native_row: usize, out_dpi: u16, native_dpi: u16) -> usize {
    native_row * out_dpi as usize / native_dpi as usize
}

/// Resample an interleaved line to `out_width` pixels. Downsampling
/// averages the covered columns, upsampling repeats them.
pub fn bin_line(line: &[u8], channels: usize, out_width: usize) -> Vec<u8> {
    let in_width = line.len() / channels;
    if in_width == out_width {
        return line.to_vec();
    }
    let mut out = Vec::with_capacity(out_width * channels);
    for j in 0..out_width {
        let start = (j * in_width / out_width).min(in_width - 1);
        let end = ((j + 1) * in_width / out_width).clamp(start + 1, in_width);
        let count = (end - start) as u32;
        for c in 0..channels {
            let sum: u32 = (start..end).map(|x| line[x * channels + c] as u32).sum();
            out.push(((sum + count / 2) / count) as u8);
        }
    }
    out
}

/// Averages native rows that map to the same output row.
#[derive(Debug)]
pub struct RowAccumulator {
    target_height: usize,
    current: Option<usize>,
    sums: Vec<u32>,
    count: u32,
    emitted: usize,
}

impl RowAccumulator {
    pub fn new(target_height: usize) -> Self {
        Self {
            target_height,
            current: None,
            sums: Vec::new(),
            count: 0,
            emitted: 0,
        }
    }

    /// Rows handed out so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn is_full(&self) -> bool {
        self.emitted >= self.target_height
    }

    /// Add a line for output row `row`. Returns the previous row when
    /// `row` moves past it.
    pub fn push(&mut self, row: usize, line: &[u8]) -> Option<Vec<u8>> {
        let flushed = match self.current {
            Some(current) if current != row => self.flush(),
            _ => None,
        };
        if self.current.is_none() {
            self.current = Some(row);
            self.sums = vec![0; line.len()];
            self.count = 0;
        }
        for (sum, &value) in self.sums.iter_mut().zip(line) {
            *sum += value as u32;
        }
        self.count += 1;
        flushed
    }

    /// Emit the row being accumulated, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.current.take()?;
        if self.is_full() || self.count == 0 {
            return None;
        }
        let count = self.count;
        self.emitted += 1;
        Some(
            self.sums
                .iter()
                .map(|&sum| ((sum + count / 2) / count) as u8)
                .collect(),
        )
    }
}
