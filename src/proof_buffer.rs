//! Proof buffer protocol client
//!
//! Drives the lifecycle of an ephemeral on-chain scratch account that
//! accumulates proof bytes for the verifier program. One fresh keypair per
//! claim attempt; buffers are single-use, so a failed attempt restarts from
//! a fresh buffer rather than resuming a partial upload. Every step is
//! confirmed before the next begins - each instruction mutates state the
//! next one depends on.

use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    system_instruction,
};

use crate::error::{RelayerError, RelayerResult};
use crate::gateway::{instruction_tag, LedgerGateway, ProofBufferHeader};

/// Protocol maximum proof size accepted by the verifier program.
pub const MAX_PROOF_SIZE: usize = 16 * 1024;

/// Per-chunk ceiling keeping each upload transaction under the wire limit
/// once signatures and account metas are accounted for.
pub const MAX_CHUNK_SIZE: usize = 900;

/// Account bytes before the proof region: discriminator + header.
pub const BUFFER_HEADER_LEN: usize = 8 + ProofBufferHeader::SIZE;

/// Buffer lifecycle. Transitions are explicit so resume-vs-restart is a
/// deliberate decision rather than a control-flow accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferState {
    Uninitialized,
    Created,
    Uploading { offset: u32 },
    Finalized,
    Failed { reason: String },
}

impl BufferState {
    /// Whether moving to `next` is a legal protocol step. `Failed` is
    /// reachable from anywhere; nothing leaves `Failed` or `Finalized`.
    fn can_advance(&self, next: &BufferState) -> bool {
        use BufferState::*;
        match (self, next) {
            (_, Failed { .. }) => !matches!(self, Failed { .. }),
            (Uninitialized, Created) => true,
            (Created, Uploading { .. }) => true,
            (Uploading { offset }, Uploading { offset: next_offset }) => next_offset > offset,
            (Uploading { .. }, Finalized) => true,
            _ => false,
        }
    }
}

/// Handle to one in-flight buffer attempt. Owns the ephemeral keypair.
pub struct BufferHandle {
    keypair: Keypair,
    expected_size: u32,
    state: BufferState,
    chunks_written: u32,
}

impl BufferHandle {
    pub fn address(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn state(&self) -> &BufferState {
        &self.state
    }

    pub fn chunks_written(&self) -> u32 {
        self.chunks_written
    }

    fn advance(&mut self, next: BufferState) -> RelayerResult<()> {
        if !self.state.can_advance(&next) {
            return Err(RelayerError::Internal(format!(
                "illegal buffer transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, reason: &str) {
        // Failure is terminal; never errors.
        self.state = BufferState::Failed {
            reason: reason.to_string(),
        };
    }
}

pub struct ProofBufferClient<'g> {
    gateway: &'g LedgerGateway,
}

impl<'g> ProofBufferClient<'g> {
    pub fn new(gateway: &'g LedgerGateway) -> Self {
        Self { gateway }
    }

    /// Allocate and initialize a fresh buffer sized for `expected_size`
    /// proof bytes. One transaction, two instructions (system create +
    /// init_buffer), signed by the relayer and the fresh buffer key.
    pub fn create_and_init(&self, expected_size: usize) -> RelayerResult<BufferHandle> {
        if expected_size == 0 {
            return Err(RelayerError::ProofUploadFailed("empty proof".to_string()));
        }
        if expected_size > MAX_PROOF_SIZE {
            return Err(RelayerError::ProofUploadFailed(format!(
                "proof size {expected_size} exceeds protocol maximum {MAX_PROOF_SIZE}"
            )));
        }

        let mut handle = BufferHandle {
            keypair: Keypair::new(),
            expected_size: expected_size as u32,
            state: BufferState::Uninitialized,
            chunks_written: 0,
        };

        let space = BUFFER_HEADER_LEN + expected_size;
        let lamports = self.gateway.rent_exempt_minimum(space)?;

        let create = system_instruction::create_account(
            &self.gateway.relayer_pubkey(),
            &handle.address(),
            lamports,
            space as u64,
            &self.gateway.verifier_program,
        );

        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&instruction_tag("init_buffer"));
        data.extend_from_slice(&handle.expected_size.to_le_bytes());
        let init = Instruction {
            program_id: self.gateway.verifier_program,
            accounts: vec![
                AccountMeta::new(handle.address(), true),
                AccountMeta::new(self.gateway.relayer_pubkey(), true),
            ],
            data,
        };

        match self
            .gateway
            .send_confirmed(&[create, init], &[&handle.keypair])
        {
            Ok(signature) => {
                tracing::debug!(buffer = %handle.address(), %signature, expected_size, "proof buffer created");
                handle.advance(BufferState::Created)?;
                Ok(handle)
            }
            Err(e) => {
                handle.fail(&e.to_string());
                Err(RelayerError::ProofUploadFailed(format!(
                    "buffer creation failed: {e}"
                )))
            }
        }
    }

    /// Upload the whole proof as sequential, non-overlapping chunks, one
    /// confirmed transaction each. Any chunk failure aborts the attempt.
    pub fn upload(&self, handle: &mut BufferHandle, proof: &[u8]) -> RelayerResult<()> {
        if proof.len() != handle.expected_size as usize {
            handle.fail("proof length mismatch");
            return Err(RelayerError::ProofUploadFailed(format!(
                "proof length {} does not match buffer size {}",
                proof.len(),
                handle.expected_size
            )));
        }

        for (index, chunk) in proof.chunks(MAX_CHUNK_SIZE).enumerate() {
            let offset = (index * MAX_CHUNK_SIZE) as u32;
            if let Err(e) = self.write_chunk(handle, offset, chunk) {
                handle.fail(&e.to_string());
                return Err(e);
            }
            handle.advance(BufferState::Uploading {
                offset: offset + chunk.len() as u32,
            })?;
            handle.chunks_written += 1;
        }

        Ok(())
    }

    fn write_chunk(&self, handle: &BufferHandle, offset: u32, chunk: &[u8]) -> RelayerResult<()> {
        let mut data = Vec::with_capacity(8 + 4 + 4 + chunk.len());
        data.extend_from_slice(&instruction_tag("write_chunk"));
        data.extend_from_slice(&offset.to_le_bytes());
        data.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        data.extend_from_slice(chunk);

        let write = Instruction {
            program_id: self.gateway.verifier_program,
            accounts: vec![
                AccountMeta::new(handle.address(), false),
                AccountMeta::new_readonly(self.gateway.relayer_pubkey(), true),
            ],
            data,
        };

        self.gateway.send_confirmed(&[write], &[]).map_err(|e| {
            RelayerError::ProofUploadFailed(format!("chunk at offset {offset} failed: {e}"))
        })?;
        Ok(())
    }

    /// Submit the public inputs to the verifier. The recipient is included
    /// so the proof is bound to exactly one payout destination. Success
    /// flips `finalized` on-chain; failure is terminal for the attempt.
    pub fn finalize_and_verify(
        &self,
        handle: &mut BufferHandle,
        commitment: &[u8; 32],
        nullifier: &[u8; 32],
        merkle_root: &[u8; 32],
        recipient: &Pubkey,
    ) -> RelayerResult<()> {
        let mut data = Vec::with_capacity(8 + 32 * 4);
        data.extend_from_slice(&instruction_tag("finalize"));
        data.extend_from_slice(commitment);
        data.extend_from_slice(nullifier);
        data.extend_from_slice(merkle_root);
        data.extend_from_slice(recipient.as_ref());

        let finalize = Instruction {
            program_id: self.gateway.verifier_program,
            accounts: vec![
                AccountMeta::new(handle.address(), false),
                AccountMeta::new_readonly(self.gateway.relayer_pubkey(), true),
            ],
            data,
        };

        match self.gateway.send_confirmed(&[finalize], &[]) {
            Ok(signature) => {
                tracing::debug!(buffer = %handle.address(), %signature, "proof buffer finalized");
                handle.advance(BufferState::Finalized)?;
                Ok(())
            }
            Err(e) => {
                handle.fail(&e.to_string());
                Err(RelayerError::VerificationFailed(format!(
                    "finalize rejected: {e}"
                )))
            }
        }
    }

    /// Reclaim the buffer's rent to the relayer after a confirmed claim.
    /// Best-effort: a failure here is the caller's to log, never to surface.
    pub fn close(&self, handle: &BufferHandle) -> RelayerResult<()> {
        let close = Instruction {
            program_id: self.gateway.verifier_program,
            accounts: vec![
                AccountMeta::new(handle.address(), false),
                AccountMeta::new(self.gateway.relayer_pubkey(), true),
            ],
            data: instruction_tag("close_buffer").to_vec(),
        };
        self.gateway.send_confirmed(&[close], &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_in(state: BufferState) -> BufferHandle {
        BufferHandle {
            keypair: Keypair::new(),
            expected_size: 1024,
            state,
            chunks_written: 0,
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut handle = handle_in(BufferState::Uninitialized);
        handle.advance(BufferState::Created).unwrap();
        handle.advance(BufferState::Uploading { offset: 900 }).unwrap();
        handle.advance(BufferState::Uploading { offset: 1024 }).unwrap();
        handle.advance(BufferState::Finalized).unwrap();
    }

    #[test]
    fn offsets_must_strictly_advance() {
        let mut handle = handle_in(BufferState::Uploading { offset: 900 });
        assert!(handle.advance(BufferState::Uploading { offset: 900 }).is_err());
        assert!(handle.advance(BufferState::Uploading { offset: 800 }).is_err());
        assert!(handle.advance(BufferState::Uploading { offset: 901 }).is_ok());
    }

    #[test]
    fn nothing_leaves_finalized_or_failed() {
        let mut handle = handle_in(BufferState::Finalized);
        assert!(handle.advance(BufferState::Created).is_err());
        assert!(handle
            .advance(BufferState::Uploading { offset: 1 })
            .is_err());

        let mut handle = handle_in(BufferState::Failed {
            reason: "x".to_string(),
        });
        assert!(handle.advance(BufferState::Created).is_err());
        assert!(handle
            .advance(BufferState::Failed {
                reason: "y".to_string()
            })
            .is_err());
    }

    #[test]
    fn failure_reachable_from_any_live_state() {
        for state in [
            BufferState::Uninitialized,
            BufferState::Created,
            BufferState::Uploading { offset: 5 },
            BufferState::Finalized,
        ] {
            let mut handle = handle_in(state);
            handle.fail("boom");
            assert!(matches!(handle.state(), BufferState::Failed { .. }));
        }
    }

    #[test]
    fn cannot_skip_creation() {
        let mut handle = handle_in(BufferState::Uninitialized);
        assert!(handle.advance(BufferState::Uploading { offset: 0 }).is_err());
        assert!(handle.advance(BufferState::Finalized).is_err());
    }

    #[test]
    fn chunk_count_for_max_proof() {
        // 16 KiB at 900 bytes per chunk -> 19 transactions.
        let chunks = (MAX_PROOF_SIZE + MAX_CHUNK_SIZE - 1) / MAX_CHUNK_SIZE;
        assert_eq!(chunks, 19);
    }
}
