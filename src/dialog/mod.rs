//! Dialog with the remote assistant service
//!
//! A turn opens a stream, sends a config message, streams captured audio up
//! and plays response audio as it arrives, until the service closes the
//! stream.

mod protocol;
mod session;
mod transport;
mod uplink;

pub use protocol::{
    AudioEncoding, AudioInConfig, AudioOutConfig, ConversationState, DialogRequest,
    DialogResponse, EventType, MicrophoneMode, SpeechResult, StreamStatus, TurnConfig,
};
pub use session::{DialogSession, DialogSettings, DialogState, TurnOutcome};
pub use transport::{
    DEFAULT_ENDPOINT, DialogStream, DialogTransport, RequestSender, ResponseReceiver,
    StreamFinisher, TcpTransport,
};
pub use uplink::{AudioUplink, UplinkStats};
