//! Key material for the forward-secure audit chain
//!
//! Root secret handling, threshold splitting, the rotating chain secret
//! and the hardware-token bootstrap path.

pub mod chain;
pub mod shamir;
pub mod share_encryption;
pub mod token;

pub use chain::{ChainSecret, Challenge, RootSecret, CHALLENGE_LEN, SECRET_LEN};
pub use shamir::{combine, interpolate, parse_shares, split, Share};
pub use share_encryption::{GpgShareEncryptor, ShareEncryptor};
pub use token::{ChallengeResponseToken, YubikeyToken};
