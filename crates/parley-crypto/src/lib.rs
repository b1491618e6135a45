pub mod envelope;
pub mod error;
pub mod exchange;
pub mod keychain;
pub mod memory_keychain;

pub use envelope::{EncryptedEnvelope, SealedPayload};
pub use error::CryptoError;
pub use exchange::{KeyExchangeService, SharedKey};
pub use keychain::Keychain;
pub use memory_keychain::MemoryKeychain;
