/*!
    AT-command channel for cellular modems.

    A single serial line is shared between the commands sent by the application and what the modem pushes on its own. The crate assembles received bytes into lines ([lines]), decides whether each line belongs to the command waiting for its reply ([classify]), maps failure statuses to structured errors ([status]), and multiplexes all of that in [channel::Channel].
*/

pub mod transport;
pub mod lines;
pub mod classify;
pub mod status;
pub mod channel;
pub mod modem;

pub use channel::{Channel, ChannelConfig, Error, Request, Response, Notification, UploadOptions, UploadResult};
pub use status::ProtocolError;
