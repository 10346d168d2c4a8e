//! Outbound ClientHello cipher suite reordering.
//!
//! [`hello`] finds the cipher suite list in a raw record, [`rewrite`] reorders
//! it in place, and [`transport::CipherConn`] applies both to every write on
//! a connection.

pub mod hello;
pub mod rewrite;
pub mod tls;
pub mod transport;

pub use hello::{locate, ClientHelloView, Mismatch};
pub use modcipher_traits::{CipherSuite, PreferenceEntry, Preferences};
pub use rewrite::{prioritize, rewrite_in_place, Rewrite};
pub use tls::{NativeProvider, RootSource, TlsProvider};
pub use transport::{BoxedStream, CipherConn, Dialer, SocketInfo};
