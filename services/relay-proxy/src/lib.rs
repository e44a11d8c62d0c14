pub mod config;
pub mod proxy;

pub use config::Config;
pub use proxy::{
    Listener, ListenerConfig, ProxyKind, RelayConnector, RelayEndpoint, RetryPolicy, Strategy,
    TunnelConfig, TunnelSession, WebSocketConnector,
};
