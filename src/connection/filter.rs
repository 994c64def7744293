use tracing::trace;

/// Transforms whole encoded block buffers on their way to and from the
///  transport, e.g. compression, obfuscation or encryption. Filters work
///  outside the codec: they see opaque bytes and may change the length.
pub trait BlockFilter: Sync + Send {
    /// for logging
    fn name(&self) -> &str;

    /// outbound direction, infallible
    fn apply(&self, buf: Vec<u8>) -> Vec<u8>;

    /// inbound direction; fails on data that was tampered with or does not
    ///  match the filter's expectations
    fn restore(&self, buf: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// An ordered list of filters. Outbound buffers are passed through them front
///  to back, inbound buffers back to front, so the chain as a whole is a
///  bijection as long as each filter is.
pub struct FilterChain {
    filters: Vec<Box<dyn BlockFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn BlockFilter>>) -> FilterChain {
        FilterChain { filters }
    }

    pub fn empty() -> FilterChain {
        FilterChain { filters: Vec::new() }
    }

    pub fn apply(&self, mut buf: Vec<u8>) -> Vec<u8> {
        for filter in &self.filters {
            trace!(filter = filter.name(), len = buf.len(), "applying filter");
            buf = filter.apply(buf);
        }
        buf
    }

    pub fn restore(&self, mut buf: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        for filter in self.filters.iter().rev() {
            trace!(filter = filter.name(), len = buf.len(), "restoring filter");
            buf = filter.restore(buf)?;
        }
        Ok(buf)
    }
}
