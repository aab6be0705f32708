/// Key derivation for secure channels and privacy proof tokens.
pub mod keyring;

pub use keyring::{ChannelKeyring, KeyringError};
