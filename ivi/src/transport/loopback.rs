/// An in-memory transport which records everything written to it and answers
/// reads from a queue of scripted replies.
///
/// Clones share their state, so a test can keep one handle while the session owns another.
/// Optional capabilities are only offered once enabled with [`LoopbackTransport::with_native`],
/// which allows exercising the session's emulation paths.
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use super::{Encoding, Transport};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    AskRaw,
    ReadStr,
    ReadStb,
    Trigger,
    Clear,
    Remote,
    Local,
}

#[derive(Default)]
struct Inner {
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    default_reply: Option<Vec<u8>>,
    native: HashSet<Capability>,
    calls: Vec<&'static str>,
    stb: u8,
    closed: bool,
    fail_close: bool,
    fail_writes_after: Option<usize>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(x) => x,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with_native(self, capability: Capability) -> Self {
        self.lock().native.insert(capability);
        self
    }

    /// Queue a reply message which is returned by subsequent reads.
    pub fn push_reply<T: AsRef<[u8]>>(&self, reply: T) {
        self.lock().replies.push_back(reply.as_ref().to_vec());
    }

    /// Reply returned whenever the reply queue is exhausted.
    pub fn set_default_reply<T: AsRef<[u8]>>(&self, reply: T) {
        self.lock().default_reply = Some(reply.as_ref().to_vec());
    }

    pub fn set_status_byte(&self, stb: u8) {
        self.lock().stb = stb;
    }

    pub fn fail_on_close(&self) {
        self.lock().fail_close = true;
    }

    /// Let every write after the first `count` writes fail.
    pub fn fail_writes_after(&self, count: usize) {
        self.lock().fail_writes_after = Some(count);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// All writes decoded as UTF-8 with the termination character stripped.
    pub fn written_lines(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|x| String::from_utf8_lossy(x).trim_end().to_string())
            .collect()
    }

    /// Names of all transport methods invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn enter(&self, call: &'static str, capability: Option<Capability>) -> crate::Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        if let Some(capability) = capability {
            if !inner.native.contains(&capability) {
                return Err(Error::NotSupported(call));
            }
        }
        inner.calls.push(call);
        Ok(inner)
    }
}

impl Inner {
    fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if let Some(count) = self.fail_writes_after {
            if self.written.len() >= count {
                return Err(Error::transport(anyhow!("Loopback write failed")));
            }
        }
        self.written.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        if self.rx.is_empty() {
            let next = self
                .replies
                .pop_front()
                .or_else(|| self.default_reply.clone())
                .ok_or_else(Error::timeout)?;
            self.rx.extend(next);
        }
        let count = max_len.unwrap_or_else(|| self.rx.len()).min(self.rx.len());
        Ok(self.rx.drain(..count).collect())
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn write_raw(&mut self, data: &[u8]) -> crate::Result<()> {
        self.enter("write_raw", None)?.write(data)
    }

    fn read_raw(&mut self, max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        self.enter("read_raw", None)?.read(max_len)
    }

    fn ask_raw(&mut self, data: &[u8], max_len: Option<usize>) -> crate::Result<Vec<u8>> {
        let mut inner = self.enter("ask_raw", Some(Capability::AskRaw))?;
        inner.write(data)?;
        inner.read(max_len)
    }

    fn read_str(&mut self, max_len: Option<usize>, encoding: Encoding) -> crate::Result<String> {
        let data = self.enter("read_str", Some(Capability::ReadStr))?.read(max_len)?;
        let ret = encoding.decode(&data)?;
        Ok(ret.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
    }

    fn read_stb(&mut self) -> crate::Result<u8> {
        Ok(self.enter("read_stb", Some(Capability::ReadStb))?.stb)
    }

    fn trigger(&mut self) -> crate::Result<()> {
        self.enter("trigger", Some(Capability::Trigger)).map(|_| ())
    }

    fn clear(&mut self) -> crate::Result<()> {
        self.enter("clear", Some(Capability::Clear)).map(|_| ())
    }

    fn remote(&mut self) -> crate::Result<()> {
        self.enter("remote", Some(Capability::Remote)).map(|_| ())
    }

    fn local(&mut self) -> crate::Result<()> {
        self.enter("local", Some(Capability::Local)).map(|_| ())
    }

    fn close(&mut self) -> crate::Result<()> {
        let mut inner = self.enter("close", None)?;
        inner.closed = true;
        if inner.fail_close {
            return Err(Error::transport(anyhow!("Loopback close failed")));
        }
        Ok(())
    }
}
