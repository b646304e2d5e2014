pub mod allocator;
pub mod config;
pub mod error;
pub mod message;
pub mod options;
pub mod reservation;
pub mod server;
pub mod store;
pub mod table;
pub mod transport;

pub use config::{Config, ConfiguredOption, OptionMode};
pub use error::{Error, Result};
pub use message::DhcpMessage;
pub use options::{DhcpOption, MessageType, OptionCode};
pub use reservation::{MacPrefix, Reservation};
pub use server::{DhcpServer, MessageInterceptor};
pub use store::{ClientStore, JsonClientStore};
pub use table::{ClientKey, ClientRecord, ClientState, LeaseTable};
pub use transport::{UdpSocketTransport, UdpTransport};
