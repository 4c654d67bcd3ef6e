use crate::error::Result;
use crate::wire::{Instruction, RemotingResult};

/// Encodes instructions and results for an rpc channel.
///
/// Object references are replaced by descriptors before a message reaches
/// the serializer, so implementations only ever see plain wire types.
pub trait Serializer: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn encode_instruction(&self, instruction: &Instruction) -> Result<Vec<u8>>;

    fn decode_instruction(&self, bytes: &[u8]) -> Result<Instruction>;

    fn encode_result(&self, result: &RemotingResult) -> Result<Vec<u8>>;

    fn decode_result(&self, bytes: &[u8]) -> Result<RemotingResult>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_instruction(&self, instruction: &Instruction) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(instruction)?)
    }

    fn decode_instruction(&self, bytes: &[u8]) -> Result<Instruction> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_result(&self, result: &RemotingResult) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(result)?)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<RemotingResult> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
