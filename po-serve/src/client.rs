//! Blocking remote-call client: the compiler's side of `get_advice`.

use po_core::{Encoding, Endpoint};
use po_proto::{recv, send, Advice, AdviceRequest};

use crate::error::ServeError;
use crate::server::Stream;

pub struct AdviceClient {
    stream: Stream,
    encoding: Encoding,
}

impl AdviceClient {
    pub fn connect(endpoint: &Endpoint, encoding: Encoding) -> Result<Self, ServeError> {
        Ok(Self {
            stream: Stream::connect(endpoint)?,
            encoding,
        })
    }

    /// One request/response round trip. `-1` in the reply ends the episode.
    pub fn get_advice(&mut self, req: &AdviceRequest) -> Result<Advice, ServeError> {
        send(&mut self.stream, self.encoding, req)?;
        Ok(recv(&mut self.stream, self.encoding)?)
    }

    /// Convenience for the first call of an episode.
    pub fn begin(&mut self, unit: Option<&str>, embedding: Vec<f32>) -> Result<Advice, ServeError> {
        self.get_advice(&AdviceRequest {
            embedding,
            unit: unit.map(str::to_string),
            ..Default::default()
        })
    }
}
