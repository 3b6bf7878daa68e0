//! Wire-format envelopes and ZeroMQ frame layouts.
//!
//! Envelopes are serialized with MessagePack. Numeric payloads keep their
//! shape and element type across the wire; the absence of data on a declared
//! edge is a distinct envelope variant, never a zero-length array.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! zeromq-rs ROUTER pushes the peer identity as the first frame on recv and
//! pops it on send; DEALER sends and receives raw application frames. The
//! runtime assigns random peer identities, so every worker self-identifies
//! with its module ID in the first application frame and the ROUTER side
//! keeps a learned `ModuleId -> identity` map:
//! - module DEALER sends `[module_id, envelope]` to the broker
//! - broker ROUTER receives `[identity, module_id, envelope]`
//! - broker ROUTER sends `[identity, envelope]`; module DEALER receives
//!   `[envelope]`
//! - worker DEALER sends `[module_id, verb]` to the manager; the manager
//!   ROUTER replies `[identity, verb]`

use serde::{Deserialize, Serialize};
use zeromq::ZmqMessage;

use tickmesh_core::ModuleId;

use crate::error::FabricError;

// ── Control verbs ────────────────────────────────────────────────────

pub mod verbs {
    /// Worker -> manager: sockets are up, the worker is serving its loop.
    pub const READY: &str = "ready";
    /// Manager -> worker: flush, stop the reactor, acknowledge, terminate.
    pub const QUIT: &str = "quit";
    /// Worker -> manager: acknowledgment of the previous control verb.
    pub const ACK: &str = "ack";
}

// ── Payloads ─────────────────────────────────────────────────────────

/// Dtype-tagged flat storage of a numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::F64(v) => v.len(),
            ArrayData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A numeric array with its shape preserved round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl PortArray {
    /// A 1-D array of f64 values.
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::F64(values),
        }
    }

    /// A 1-D array of i64 values.
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::I64(values),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The f64 storage, when this is an f64 array.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ArrayData::F64(v) => Some(v),
            ArrayData::I64(_) => None,
        }
    }

    /// True when the declared shape matches the stored element count.
    pub fn is_consistent(&self) -> bool {
        self.shape.iter().product::<usize>() == self.data.len()
    }
}

/// Per-tick payload on a declared edge.
///
/// `Empty` is the absence sentinel: it satisfies the barrier without
/// carrying data and is distinguishable from a zero-length array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickPayload {
    Empty,
    Data(PortArray),
}

impl TickPayload {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, TickPayload::Empty)
    }

    fn is_consistent(&self) -> bool {
        match self {
            TickPayload::Empty => true,
            TickPayload::Data(arr) => arr.is_consistent(),
        }
    }
}

// ── Envelopes ────────────────────────────────────────────────────────

/// Module -> broker envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataMessage {
    /// Registration: lets the broker learn the sender's identity before any
    /// barrier involving it completes. Pure sinks never send ticks, so this
    /// is their only chance to become addressable.
    Hello,
    /// One tick's worth of data for a single declared outbound edge.
    Tick { dst: ModuleId, payload: TickPayload },
}

/// Broker -> module envelope: one frame per declared inbound edge per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub src: ModuleId,
    pub payload: TickPayload,
}

// ── Data channel framing ─────────────────────────────────────────────

/// Build the `[module_id, envelope]` frames a module sends to the broker.
pub fn data_frame(src: &ModuleId, msg: &DataMessage) -> Result<ZmqMessage, FabricError> {
    let mut z = ZmqMessage::from(src.as_str());
    z.push_back(rmp_serde::to_vec(msg)?.into());
    Ok(z)
}

/// Parse `[identity, module_id, envelope]` as received on the broker ROUTER.
pub fn parse_data_frame(msg: &ZmqMessage) -> Result<(Vec<u8>, ModuleId, DataMessage), FabricError> {
    let frames: Vec<_> = msg.iter().collect();
    if frames.len() < 3 {
        return Err(FabricError::InvalidMessage(format!(
            "expected [identity, module id, envelope], got {} frames",
            frames.len()
        )));
    }
    let identity = frames[0].as_ref().to_vec();
    let src = parse_module_id(frames[1].as_ref())?;
    let data: DataMessage = rmp_serde::from_slice(frames[2].as_ref())?;
    if let DataMessage::Tick { payload, .. } = &data {
        if !payload.is_consistent() {
            return Err(FabricError::InvalidMessage(
                "payload shape does not match its element count".to_string(),
            ));
        }
    }
    Ok((identity, src, data))
}

/// Build the `[identity, envelope]` frames the broker sends to a module.
pub fn delivery_frame(identity: &[u8], delivery: &Delivery) -> Result<ZmqMessage, FabricError> {
    let mut z = ZmqMessage::from(identity.to_vec());
    z.push_back(rmp_serde::to_vec(delivery)?.into());
    Ok(z)
}

/// Parse the `[envelope]` frames a module receives from the broker.
pub fn parse_delivery_frame(msg: &ZmqMessage) -> Result<Delivery, FabricError> {
    let envelope = first_data_frame(msg)?;
    let delivery: Delivery = rmp_serde::from_slice(envelope)?;
    if !delivery.payload.is_consistent() {
        return Err(FabricError::InvalidMessage(
            "payload shape does not match its element count".to_string(),
        ));
    }
    Ok(delivery)
}

// ── Control channel framing ──────────────────────────────────────────

/// Build the `[module_id, verb]` frames a worker sends to the manager.
pub fn ctrl_frame(id: &ModuleId, verb: &str) -> ZmqMessage {
    let mut z = ZmqMessage::from(id.as_str());
    z.push_back(verb.as_bytes().to_vec().into());
    z
}

/// Parse `[identity, module_id, verb]` as received on the manager ROUTER.
pub fn parse_ctrl_frame(msg: &ZmqMessage) -> Result<(Vec<u8>, ModuleId, String), FabricError> {
    let frames: Vec<_> = msg.iter().collect();
    if frames.len() < 3 {
        return Err(FabricError::InvalidMessage(format!(
            "expected [identity, module id, verb], got {} frames",
            frames.len()
        )));
    }
    let identity = frames[0].as_ref().to_vec();
    let id = parse_module_id(frames[1].as_ref())?;
    let verb = String::from_utf8_lossy(frames[2].as_ref()).into_owned();
    Ok((identity, id, verb))
}

/// Build the `[identity, verb]` frames the manager sends to a worker.
pub fn ctrl_reply(identity: Vec<u8>, verb: &str) -> ZmqMessage {
    let mut z = ZmqMessage::from(identity);
    z.push_back(verb.as_bytes().to_vec().into());
    z
}

/// Parse the `[verb]` frames a worker receives from the manager.
pub fn parse_ctrl_verb(msg: &ZmqMessage) -> Result<String, FabricError> {
    let verb = first_data_frame(msg)?;
    Ok(String::from_utf8_lossy(verb).into_owned())
}

// ── Helpers ──────────────────────────────────────────────────────────

fn parse_module_id(frame: &[u8]) -> Result<ModuleId, FabricError> {
    let id = std::str::from_utf8(frame)
        .map_err(|_| FabricError::InvalidMessage("module id frame is not UTF-8".to_string()))?;
    if id.is_empty() {
        return Err(FabricError::InvalidMessage(
            "module id frame is empty".to_string(),
        ));
    }
    Ok(ModuleId::new(id))
}

/// First non-empty frame. Leading empty delimiter frames can appear on a
/// DEALER depending on the peer's reply framing.
fn first_data_frame(msg: &ZmqMessage) -> Result<&[u8], FabricError> {
    msg.iter()
        .map(|f| f.as_ref())
        .find(|f| !f.is_empty())
        .ok_or_else(|| FabricError::InvalidMessage("message has no data frames".to_string()))
}
