/*!
    helpers for modem drivers built on a [Channel]
*/

use std::time::Duration;
use log::*;

use crate::channel::{Channel, Error, Request};


/// command disabling the echo of commands, and the first one sent to a modem waking up
pub const ECHO_OFF: &str = "ATE0";

/**
    wake the modem up by disabling its echo, retrying up to `attempts` times with no backoff

    a modem waking up usually ignores its first commands, each attempt waits `timeout` for the reply. Fails with [Error::WakeUp] once all attempts are exhausted, transport failures are returned immediately.
*/
pub async fn wake_up(channel: &Channel, attempts: usize, timeout: Duration) -> Result<(), Error> {
    for attempt in 1 ..= attempts {
        let response = channel.execute(Request::new(ECHO_OFF).timeout(timeout)).await?;
        if response.success {
            debug!("modem awake after {} attempts", attempt);
            return Ok(())
        }
        debug!("wake up attempt {} failed: {:?}", attempt, response.status);
    }
    Err(Error::WakeUp {attempts})
}
