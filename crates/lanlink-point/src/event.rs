/// Signals funneled through a worker's event loop.
///
/// Failures inside a worker's tasks never cross task boundaries as errors;
/// they are turned into one of these and handled by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Connected,
    Closed,
    LoginSuccess,
    Reconnect(String),
    /// The switch asked for a fresh login
    SignIn,
    DeviceReset,
    /// Reader task of the given generation failed
    ReadError { generation: u64, reason: String },
    AddressChanged(String),
    Stop,
}
