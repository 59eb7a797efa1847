use std::io::Read;

/// Presents a sequence of N numbered blob parts as one logically
/// contiguous input stream.
///
/// Slice 0 is opened on the first read; each EOF advances to the next
/// slice. Bytes are handed through without an intermediate copy.
pub struct SlicedInput<F> {
    open_slice: F,
    slices: u32,
    next_slice: u32,
    current: Option<Box<dyn Read + Send>>,
}

impl<F> SlicedInput<F>
where
    F: FnMut(u32) -> std::io::Result<Box<dyn Read + Send>>,
{
    pub fn new(slices: u32, open_slice: F) -> Self {
        Self {
            open_slice,
            slices,
            next_slice: 0,
            current: None,
        }
    }
}

impl<F> Read for SlicedInput<F>
where
    F: FnMut(u32) -> std::io::Result<Box<dyn Read + Send>>,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = &mut self.current {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if self.next_slice >= self.slices {
                return Ok(0);
            }
            let slice = (self.open_slice)(self.next_slice)?;
            self.next_slice += 1;
            self.current = Some(slice);
        }
    }
}

/// Read adaptor that polls a cancellation probe before every read and
/// fails with the probe's error once cancellation is observed.
///
/// The snapshot creator wraps each upload stream with this so a sticky
/// abort flag interrupts transfers between reads.
pub struct AbortableRead<R, P> {
    inner: R,
    probe: P,
}

impl<R, P> AbortableRead<R, P>
where
    P: FnMut() -> Option<std::io::Error>,
{
    pub fn new(inner: R, probe: P) -> Self {
        Self { inner, probe }
    }
}

impl<R: Read, P> Read for AbortableRead<R, P>
where
    P: FnMut() -> Option<std::io::Error>,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(err) = (self.probe)() {
            return Err(err);
        }
        self.inner.read(buf)
    }
}
