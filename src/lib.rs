//! filevault
//!
//! An authenticated file transfer service over TLS. A client opens one
//! long-lived secure connection, authenticates with a username/password
//! pair, and issues commands (`upload`, `download`, `view`, `delete`,
//! `list`, `quit`) against its own isolated storage area.
//!
//! ## Features
//! - Length-prefixed, kind-tagged framing: file content is never confused
//!   with protocol signals, whatever bytes it contains
//! - Per-chunk acknowledged uploads (one chunk in flight)
//! - SHA-256 integrity verification on both transfer directions
//! - Per-user storage roots with enforced filename confinement
//! - One independent session task per connection, graceful shutdown
//!
//! ## Usage
//!
//! ```bash
//! # Generate a development certificate
//! filevault cert generate --output ./certs
//!
//! # Start the server
//! filevault server --cert ./certs/cert.pem --key ./certs/key.pem \
//!     --storage ./server_storage --auth-file ./id_passwd.txt
//!
//! # Upload, list, fetch
//! filevault upload --ca ./certs/cert.pem -u alice -p secret notes.txt
//! filevault list --ca ./certs/cert.pem -u alice -p secret
//! filevault download --ca ./certs/cert.pem -u alice -p secret notes.txt
//! ```

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tls;
