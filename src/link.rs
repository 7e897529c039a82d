use std::io;

/// Byte stream to the host (USB CDC or serial).
///
/// Reads never block for long: `poll_byte` returns `None` when nothing
/// arrived within the transport's polling interval, so callers can keep
/// checking their abort signal.
pub trait HostLink: io::Write + Send {
    fn poll_byte(&mut self) -> Option<u8>;
}

#[cfg(test)]
pub(crate) mod mem {
    use super::HostLink;
    use std::collections::VecDeque;
    use std::io;

    /// In-memory link: scripted host bytes in, everything sent captured.
    #[derive(Default)]
    pub(crate) struct MemLink {
        pub(crate) input: VecDeque<u8>,
        pub(crate) output: Vec<u8>,
        /// Raised when the scripted input runs dry.
        pub(crate) on_drain: Option<crate::CancelToken>,
    }

    impl MemLink {
        pub(crate) fn with_input(bytes: &[u8]) -> Self {
            Self {
                input: bytes.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl io::Write for MemLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl HostLink for MemLink {
        fn poll_byte(&mut self) -> Option<u8> {
            let byte = self.input.pop_front();
            if byte.is_none() {
                if let Some(token) = &self.on_drain {
                    token.cancel();
                }
            }
            byte
        }
    }
}
