use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::Transport;

/// In-memory transport replaying scripted inbound fragments
///
/// Every `read` hands out the next fragment, or nothing once the script is
/// exhausted. Writes are recorded one entry per call.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    inbound: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    write_limit: Option<usize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue inbound data, one fragment per read
    pub fn with_fragments<I, B>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        self.inbound
            .extend(fragments.into_iter().map(|f| f.as_ref().to_vec()));
        self
    }

    /// Queue inbound data in fragments of `size` bytes
    pub fn with_stream(self, data: &[u8], size: usize) -> Self {
        self.with_fragments(data.chunks(size))
    }

    /// Accept at most `limit` bytes in total, then fail
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.concat()
    }

    pub fn pending_reads(&self) -> usize {
        self.inbound.len()
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let accepted = match self.write_limit.as_mut() {
            Some(0) => return Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            Some(remaining) => {
                let n = data.len().min(*remaining);
                *remaining -= n;
                n
            }
            None => data.len(),
        };
        self.writes.push(data[..accepted].to_vec());
        Ok(accepted)
    }

    fn read(
        &mut self,
        max_len: usize,
        _timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        match self.inbound.pop_front() {
            Some(mut fragment) if fragment.len() > max_len => {
                let rest = fragment.split_off(max_len);
                self.inbound.push_front(rest);
                Ok(fragment)
            }
            Some(fragment) => Ok(fragment),
            None => Ok(Vec::new()),
        }
    }
}
