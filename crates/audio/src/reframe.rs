//! Fixed-duration reframing
//!
//! The PBX and most providers deliver audio in whatever chunk sizes their
//! sockets produce; everything downstream wants exact 20 ms frames. A
//! [`Reframer`] buffers arbitrary byte slices and yields complete frames;
//! only an explicit [`Reframer::flush`] zero-pads a trailing partial frame.

use bytes::Bytes;

/// Buffering reframer producing fixed-size frames.
#[derive(Debug)]
pub struct Reframer {
    frame_bytes: usize,
    buffer: Vec<u8>,
}

impl Reframer {
    /// `frame_bytes` is the exact output frame size, e.g.
    /// `AudioFormat::frame_bytes()` for one 20 ms wire frame.
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            buffer: Vec::with_capacity(frame_bytes * 2),
        }
    }

    /// Append input and drain all complete frames.
    pub fn push(&mut self, input: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(input);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_bytes {
            let frame: Vec<u8> = self.buffer.drain(..self.frame_bytes).collect();
            frames.push(Bytes::from(frame));
        }
        frames
    }

    /// Number of buffered bytes not yet forming a full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Emit the trailing partial frame zero-padded to full size, if any.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.buffer);
        frame.resize(self.frame_bytes, 0);
        Some(Bytes::from(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_only_complete_frames() {
        let mut reframer = Reframer::new(160);
        assert!(reframer.push(&[1u8; 100]).is_empty());
        let frames = reframer.push(&[2u8; 100]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160);
        assert_eq!(reframer.pending(), 40);
    }

    #[test]
    fn splits_large_input_into_multiple_frames() {
        let mut reframer = Reframer::new(160);
        let frames = reframer.push(&[0u8; 500]);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert_eq!(reframer.pending(), 20);
    }

    #[test]
    fn flush_zero_pads_partial_frame() {
        let mut reframer = Reframer::new(160);
        reframer.push(&[7u8; 30]);
        let tail = reframer.flush().unwrap();
        assert_eq!(tail.len(), 160);
        assert_eq!(&tail[..30], &[7u8; 30][..]);
        assert!(tail[30..].iter().all(|&b| b == 0));
        assert!(reframer.flush().is_none());
    }

    #[test]
    fn preserves_byte_order_across_pushes() {
        let mut reframer = Reframer::new(4);
        let mut out = Vec::new();
        for chunk in [&[1u8, 2][..], &[3, 4, 5][..], &[6, 7, 8, 9][..]] {
            for frame in reframer.push(chunk) {
                out.extend_from_slice(&frame);
            }
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reframer.pending(), 1);
    }
}
