mod sealed_file;
mod token_store;

pub use sealed_file::{SealedFile, SealedFileError};
pub use token_store::{TokenBackend, TokenStore, TokenStoreError};
