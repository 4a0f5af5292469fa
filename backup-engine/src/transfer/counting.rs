//! Byte-counting reader for copy progress.

use std::io::{self, Read};

/// Reader wrapper that reports every non-empty read to a callback.
///
/// No buffering of its own; errors pass straight through.
pub struct ByteCounter<R, F> {
    inner: R,
    bytes_read: u64,
    callback: F,
}

impl<R, F> ByteCounter<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    pub fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            bytes_read: 0,
            callback,
        }
    }

    /// Total bytes read through this wrapper
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R, F> Read for ByteCounter<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.bytes_read += n as u64;
            (self.callback)(n as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[test]
    fn test_counts_every_read() {
        let data = vec![7u8; 10_000];
        let mut seen = Vec::new();
        let mut counter = ByteCounter::new(&data[..], |n| seen.push(n));

        let mut sink = Vec::new();
        io::copy(&mut counter, &mut sink).unwrap();

        assert_eq!(counter.bytes_read(), 10_000);
        drop(counter);
        assert_eq!(seen.iter().sum::<u64>(), 10_000);
        assert!(seen.iter().all(|&n| n > 0));
        assert_eq!(sink, data);
    }

    #[test]
    fn test_errors_pass_through_without_callback() {
        let mut calls = 0;
        let mut counter = ByteCounter::new(Failing, |_| calls += 1);
        let err = counter.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        drop(counter);
        assert_eq!(calls, 0);
    }
}
