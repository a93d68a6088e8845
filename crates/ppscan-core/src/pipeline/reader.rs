//! Streaming scan data from the scanner into output lines.

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::descramble::{Descrambler, RawFormat};
use super::geometry::{ColorMode, LineartParams, ScanGeometry};
use super::lineart::Binarizer;
use super::scaling::{RowAccumulator, bin_line, row_map};
use crate::error::ScanError;
use crate::protocol::constants::CMD_DATA;
use crate::protocol::{ProtocolError, ScannerLink, SyncOp};

/// Turns raw scanner lines into output bytes on demand.
#[derive(Debug)]
pub struct ScanPipeline {
    geometry: ScanGeometry,
    descrambler: Descrambler,
    rows: RowAccumulator,
    binarizer: Option<Binarizer>,
    output: VecDeque<u8>,
    buffer_size: usize,
    raw_received: usize,
    native_rows: usize,
}

impl ScanPipeline {
    pub fn new(geometry: ScanGeometry, buffer_size: usize, lineart: LineartParams) -> Self {
        let format = RawFormat::new(
            geometry.model.layout(),
            geometry.channels(),
            geometry.raw_width,
            geometry.delta,
        );
        let binarizer =
            (geometry.mode == ColorMode::Lineart).then(|| Binarizer::new(geometry.dpi, lineart));
        Self {
            rows: RowAccumulator::new(geometry.target_height),
            descrambler: Descrambler::new(format),
            binarizer,
            output: VecDeque::new(),
            buffer_size,
            raw_received: 0,
            native_rows: 0,
            geometry,
        }
    }

    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    pub fn raw_format(&self) -> &RawFormat {
        self.descrambler.format()
    }

    /// Output rows produced so far.
    pub fn rows_done(&self) -> usize {
        self.rows.emitted()
    }

    /// All raw data is in and every output byte has been read.
    pub fn is_complete(&self) -> bool {
        self.raw_done() && self.output.is_empty()
    }

    fn raw_done(&self) -> bool {
        self.raw_received >= self.geometry.raw_lines
    }

    /// Bytes per data request: whole raw lines, at least one.
    pub fn chunk_bytes(&self) -> usize {
        let line = self.raw_format().line_bytes();
        (self.buffer_size / line).max(1) * line
    }

    /// Return up to `max_len` output bytes, pulling chunks from the
    /// scanner as needed. An empty result means the scan is finished.
    pub fn read<L: ScannerLink + ?Sized>(
        &mut self,
        link: &mut L,
        max_len: usize,
    ) -> Result<Vec<u8>, ScanError> {
        while self.output.len() < max_len && !self.raw_done() {
            self.fetch_chunk(link)?;
        }
        let take = max_len.min(self.output.len());
        Ok(self.output.drain(..take).collect())
    }

    fn fetch_chunk<L: ScannerLink + ?Sized>(&mut self, link: &mut L) -> Result<(), ScanError> {
        let line_bytes = self.raw_format().line_bytes();
        let remaining = (self.geometry.raw_lines - self.raw_received) * line_bytes;
        let want = self.chunk_bytes().min(remaining);

        let data = link.cmd_get_buffer(CMD_DATA, want)?;
        if data.len() != want {
            return Err(ProtocolError::LengthMismatch {
                expected: want,
                actual: data.len(),
            }
            .into());
        }
        trace!(bytes = want, remaining, "Scan chunk");

        for raw in data.chunks_exact(line_bytes) {
            self.raw_received += 1;
            self.process_line(raw);
        }

        if self.raw_done() {
            self.finish();
            debug!(
                raw_lines = self.raw_received,
                rows = self.rows.emitted(),
                "Raw data complete"
            );
        } else {
            link.cmd_sync(SyncOp::Continue)?;
        }
        Ok(())
    }

    fn process_line(&mut self, raw: &[u8]) {
        let Some(native) = self.descrambler.push_line(raw) else {
            return;
        };
        let channels = self.geometry.channels();
        let line = bin_line(&native, channels, self.geometry.target_width);
        let row = row_map(self.native_rows, self.geometry.dpi, self.geometry.native_y);
        self.native_rows += 1;
        if let Some(done) = self.rows.push(row, &line) {
            self.emit(done);
        }
    }

    fn finish(&mut self) {
        if let Some(done) = self.rows.flush() {
            self.emit(done);
        }
    }

    fn emit(&mut self, row: Vec<u8>) {
        match &self.binarizer {
            Some(binarizer) => self.output.extend(binarizer.binarize(&row)),
            None => self.output.extend(row),
        }
    }
}
