//! Holds back output until every stream has spoken.
//!
//! The container header needs final per-stream parameters (decoder buffer
//! sizes, bit rates) that are only known once each stream has delivered a
//! frame. Until then submitted frames are kept here; the first frame of the
//! last silent stream triggers the parameter fix-up, the header and a replay
//! of everything held, in submission order.

use std::collections::VecDeque;

use tracing::debug;

use crate::error::MuxError;

/// One submission from a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
    /// Producer hint, seconds.
    pub dts: Option<f64>,
    /// Producer hint, seconds.
    pub pts: Option<f64>,
}

/// The write path behind a [`Rendezvous`].
pub trait ContainerWriter {
    /// Finalizes a stream's parameters from its first submission. Streams
    /// that never submit are not called.
    fn fix_stream_parameters(&mut self, stream: usize, first: &Chunk) -> Result<(), MuxError>;

    fn write_header(&mut self) -> Result<(), MuxError>;

    fn write_chunk(&mut self, stream: usize, chunk: Chunk) -> Result<(), MuxError>;
}

#[derive(Debug)]
pub struct Rendezvous<C> {
    writer: C,
    seen: Vec<bool>,
    held: VecDeque<(usize, Chunk)>,
    open: bool,
}

impl<C: ContainerWriter> Rendezvous<C> {
    pub fn new(writer: C) -> Self {
        Self {
            writer,
            seen: Vec::new(),
            held: VecDeque::new(),
            open: false,
        }
    }

    pub fn writer(&self) -> &C {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut C {
        &mut self.writer
    }

    pub fn into_writer(self) -> C {
        self.writer
    }

    /// Whether the header has been written.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Adds a stream to wait for, returning its index.
    pub fn register(&mut self) -> usize {
        self.seen.push(false);
        self.seen.len() - 1
    }

    /// Number of chunks waiting for the rendezvous.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn submit(&mut self, stream: usize, chunk: Chunk) -> Result<(), MuxError> {
        if self.open {
            return self.writer.write_chunk(stream, chunk);
        }
        if stream >= self.seen.len() {
            return Err(MuxError::UnknownStream(stream));
        }
        self.held
            .try_reserve(1)
            .map_err(|_| MuxError::Allocation {
                what: "rendezvous buffer",
                bytes: chunk.data.len(),
            })?;
        self.held.push_back((stream, chunk));
        self.seen[stream] = true;
        if self.seen.iter().all(|s| *s) {
            self.open()?;
        }
        Ok(())
    }

    /// Performs the rendezvous now, even if some streams have not submitted
    /// anything. No-op once open.
    pub fn open(&mut self) -> Result<(), MuxError> {
        if self.open {
            return Ok(());
        }
        for stream in 0..self.seen.len() {
            if let Some((_, first)) = self.held.iter().find(|(s, _)| *s == stream) {
                self.writer.fix_stream_parameters(stream, first)?;
            }
        }
        self.writer.write_header()?;
        self.open = true;
        debug!(held = self.held.len(), "rendezvous complete, replaying held frames");
        while let Some((stream, chunk)) = self.held.pop_front() {
            self.writer.write_chunk(stream, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl ContainerWriter for Recorder {
        fn fix_stream_parameters(&mut self, stream: usize, first: &Chunk) -> Result<(), MuxError> {
            self.calls.push(format!("fix {stream} {}", first.data[0]));
            Ok(())
        }

        fn write_header(&mut self) -> Result<(), MuxError> {
            self.calls.push("header".into());
            Ok(())
        }

        fn write_chunk(&mut self, stream: usize, chunk: Chunk) -> Result<(), MuxError> {
            self.calls.push(format!("chunk {stream} {}", chunk.data[0]));
            Ok(())
        }
    }

    fn chunk(tag: u8) -> Chunk {
        Chunk {
            data: vec![tag],
            is_keyframe: false,
            dts: None,
            pts: None,
        }
    }

    #[test]
    fn test_holds_until_every_stream_submits() {
        let mut r = Rendezvous::new(Recorder::default());
        let video = r.register();
        let audio = r.register();

        r.submit(video, chunk(1)).unwrap();
        r.submit(video, chunk(2)).unwrap();
        assert!(!r.is_open());
        assert!(r.writer().calls.is_empty());
        assert_eq!(r.held(), 2);

        r.submit(audio, chunk(3)).unwrap();
        assert!(r.is_open());
        r.submit(audio, chunk(4)).unwrap();
        assert_eq!(
            r.writer().calls,
            vec![
                "fix 0 1", "fix 1 3", "header", "chunk 0 1", "chunk 0 2", "chunk 1 3",
                "chunk 1 4"
            ]
        );
    }

    #[test]
    fn test_open_without_all_streams() {
        let mut r = Rendezvous::new(Recorder::default());
        let video = r.register();
        r.register();
        r.submit(video, chunk(9)).unwrap();
        r.open().unwrap();
        r.open().unwrap();
        assert_eq!(r.writer().calls, vec!["fix 0 9", "header", "chunk 0 9"]);
    }

    #[test]
    fn test_unknown_stream() {
        let mut r = Rendezvous::new(Recorder::default());
        assert!(matches!(
            r.submit(3, chunk(0)),
            Err(MuxError::UnknownStream(3))
        ));
    }
}
