// src/utils/token.rs
use rand::RngCore;

const SHARE_TOKEN_BYTES: usize = 24;
const NODE_SECRET_BYTES: usize = 16;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Bearer token handed to a federation partner. 48 lowercase hex characters.
pub fn generate_share_token() -> String {
    random_hex(SHARE_TOKEN_BYTES)
}

/// Secret an agent presents on `/flow/*` and the control plane presents on commands.
pub fn generate_node_secret() -> String {
    random_hex(NODE_SECRET_BYTES)
}

/// Opaque reservation identifier returned by `runtime/reserve`.
pub fn generate_reservation_id() -> String {
    format!("rsv-{}", random_hex(12))
}
