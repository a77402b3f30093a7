use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use bddf_storage::{ByteSink, ByteSource};
use bytes::{BufMut, Bytes};
use common_base::iterator::AsyncIterator;
use protobuf::{MessageDyn, MessageFull};

use crate::format::block::Block;
use crate::reader::IndexedReader;
use crate::series::SeriesDescriptor;
use crate::typed::protobuf::{protobuf_metadata, DecoderRegistry, ProtobufSeriesReader};
use crate::writer::BlockWriter;
use crate::{Error, Result};

/// GrpcEnvelope wraps a captured message with the id shared by a request and its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcEnvelope {
    pub correlation_id: u64,
    pub message: Bytes,
}

impl GrpcEnvelope {
    pub fn marshal_binary(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(8 + self.message.len());
        b.put_u64(self.correlation_id);
        b.extend_from_slice(self.message.as_ref());
        b
    }

    pub fn unmarshal_binary(b: &Bytes) -> Option<Self> {
        if b.len() < 8 {
            return None;
        }
        let correlation_id = u64::from_be_bytes(b[..8].try_into().ok()?);
        Some(Self {
            correlation_id,
            message: b.slice(8..),
        })
    }
}

/// request_channel and response_channel name the two channels capturing a method.
pub fn request_channel(service: &str, method: &str) -> String {
    format!("{}/{}/request", service, method)
}

pub fn response_channel(service: &str, method: &str) -> String {
    format!("{}/{}/response", service, method)
}

/// GrpcLogWriter captures the requests and responses of one RPC method.
pub struct GrpcLogWriter<Req, Resp> {
    request: u32,
    response: u32,
    next_id: u64,
    _m: PhantomData<fn(&Req, &Resp)>,
}

impl<Req: MessageFull, Resp: MessageFull> GrpcLogWriter<Req, Resp> {
    pub async fn register<S: ByteSink>(
        writer: &mut BlockWriter<S>,
        service: &str,
        method: &str,
    ) -> Result<Self> {
        let request = writer
            .register(request_channel(service, method).as_str(), protobuf_metadata::<Req>()?)
            .await?;
        let response = writer
            .register(response_channel(service, method).as_str(), protobuf_metadata::<Resp>()?)
            .await?;

        Ok(Self {
            request,
            response,
            next_id: 0,
            _m: PhantomData,
        })
    }

    /// log_request records a request and returns the correlation id its response is logged
    /// with.
    pub async fn log_request<S: ByteSink>(
        &mut self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        request: &Req,
    ) -> Result<u64> {
        let correlation_id = self.next_id;
        let envelope = GrpcEnvelope {
            correlation_id,
            message: Bytes::from(request.write_to_bytes()?),
        };
        writer
            .append(self.request, timestamp, envelope.marshal_binary().as_slice())
            .await?;

        self.next_id += 1;
        Ok(correlation_id)
    }

    pub async fn log_response<S: ByteSink>(
        &self,
        writer: &mut BlockWriter<S>,
        timestamp: i64,
        correlation_id: u64,
        response: &Resp,
    ) -> Result<u64> {
        let envelope = GrpcEnvelope {
            correlation_id,
            message: Bytes::from(response.write_to_bytes()?),
        };
        writer
            .append(self.response, timestamp, envelope.marshal_binary().as_slice())
            .await
    }

    pub fn request_channel_id(&self) -> u32 {
        self.request
    }

    pub fn response_channel_id(&self) -> u32 {
        self.response
    }
}

/// GrpcCall is a captured request with the response paired to it, if any.
pub struct GrpcCall {
    pub correlation_id: u64,
    pub request_timestamp: i64,
    pub request: Box<dyn MessageDyn>,
    pub response: Option<(i64, Box<dyn MessageDyn>)>,
}

struct Captured {
    timestamp: i64,
    envelope: GrpcEnvelope,
}

/// GrpcLogReader reconstructs the calls of one RPC method from an indexed file.
pub struct GrpcLogReader<'a, R> {
    reader: &'a IndexedReader<R>,
    request: Arc<SeriesDescriptor>,
    response: Arc<SeriesDescriptor>,
    request_decoder: ProtobufSeriesReader,
    response_decoder: ProtobufSeriesReader,
}

impl<'a, R: ByteSource> GrpcLogReader<'a, R> {
    pub fn new(
        reader: &'a IndexedReader<R>,
        service: &str,
        method: &str,
        registry: &DecoderRegistry,
    ) -> Result<Self> {
        let lookup = |name: String| {
            reader.descriptor_by_name(name.as_str()).ok_or_else(|| {
                Error::schema_mismatch(name.as_str(), "channel not found in file")
            })
        };
        let request = lookup(request_channel(service, method))?;
        let response = lookup(response_channel(service, method))?;

        Ok(Self {
            reader,
            request_decoder: ProtobufSeriesReader::new(request.clone(), registry)?,
            response_decoder: ProtobufSeriesReader::new(response.clone(), registry)?,
            request,
            response,
        })
    }

    /// pairs joins every request with the response carrying its correlation id, taking the
    /// earliest unused one logged at or after the request.  Unreadable records are skipped.
    pub async fn pairs(&self) -> Result<Vec<GrpcCall>> {
        let requests = self.captured(&self.request).await?;
        let responses = self.captured(&self.response).await?;

        let mut by_id: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (i, r) in responses.iter().enumerate() {
            by_id.entry(r.envelope.correlation_id).or_default().push(i);
        }
        for candidates in by_id.values_mut() {
            candidates.sort_by_key(|&i| responses[i].timestamp);
        }

        let mut used = HashSet::new();
        let mut calls = Vec::with_capacity(requests.len());
        for request in &requests {
            let id = request.envelope.correlation_id;
            let paired = by_id.get(&id).and_then(|candidates| {
                candidates
                    .iter()
                    .copied()
                    .find(|&i| !used.contains(&i) && responses[i].timestamp >= request.timestamp)
            });
            if let Some(i) = paired {
                used.insert(i);
            }

            if let Some(call) = self.call(request, paired.map(|i| &responses[i])) {
                calls.push(call);
            }
        }
        Ok(calls)
    }

    /// pairs_by_order pairs the n-th request with the n-th response, ignoring correlation
    /// ids.  Only sound for strictly sequential request/response traffic.
    pub async fn pairs_by_order(&self) -> Result<Vec<GrpcCall>> {
        let requests = self.captured(&self.request).await?;
        let responses = self.captured(&self.response).await?;

        let calls = requests
            .iter()
            .enumerate()
            .filter_map(|(i, request)| self.call(request, responses.get(i)))
            .collect();
        Ok(calls)
    }

    fn call(&self, request: &Captured, response: Option<&Captured>) -> Option<GrpcCall> {
        let decoded = match self.request_decoder.decode_bytes(request.envelope.message.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("skipping request {}: {}", request.envelope.correlation_id, e);
                return None;
            }
        };

        let response = response.and_then(|r| {
            match self.response_decoder.decode_bytes(r.envelope.message.as_ref()) {
                Ok(decoded) => Some((r.timestamp, decoded)),
                Err(e) => {
                    warn!("dropping response {}: {}", r.envelope.correlation_id, e);
                    None
                }
            }
        });

        Some(GrpcCall {
            correlation_id: request.envelope.correlation_id,
            request_timestamp: request.timestamp,
            request: decoded,
            response,
        })
    }

    /// captured reads the envelopes of a channel in sequence order.
    async fn captured(&self, descriptor: &SeriesDescriptor) -> Result<Vec<Captured>> {
        let mut itr = self.reader.blocks_for_channel(descriptor.channel_id)?;
        let mut captured = Vec::with_capacity(itr.remaining());

        while itr.remaining() > 0 {
            let block: Block = match itr.try_next().await {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: {}", descriptor.channel_name, e);
                    continue;
                }
            };

            match GrpcEnvelope::unmarshal_binary(&block.payload) {
                Some(envelope) => captured.push(Captured {
                    timestamp: block.timestamp,
                    envelope,
                }),
                None => warn!(
                    "{}: block {} is not an envelope",
                    descriptor.channel_name, block.sequence
                ),
            }
        }
        Ok(captured)
    }
}
