use std::time::Duration;
use futures_concurrency::future::Race;
use atchannel::{
    channel::{Channel, ChannelConfig, Error, UploadOptions},
    transport::SerialConfig,
    modem::wake_up,
    };

/// send a text message, its body being uploaded after the modem's prompt
#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(number), Some(text)) = (args.next(), args.next())
        else {panic!("usage: upload <number> <text>")};

    let channel = Channel::open(&SerialConfig::new("/dev/ttyUSB2", 115_200), ChannelConfig::default()).unwrap();
    // the message reference and final status come after the upload
    channel.subscribe(|notification| println!("notification {:?}", notification.lines));

    let task = async {
        wake_up(&channel, 10, Duration::from_millis(300)).await?;
        channel.command("AT+CMGF=1").await?.into_result()?;
        let mut body = text.into_bytes();
        // ctrl-z ends the message
        body.push(0x1a);
        let result = channel.begin_upload(&format!("AT+CMGS=\"{}\"", number), &body, UploadOptions::default()).await?;
        println!("upload {:?}, {} bytes written", result.state, result.written);
        tokio::time::sleep(Duration::from_secs(5)).await;
        channel.close().await
    };
    let com = async {
        channel.run().await?;
        std::future::pending::<Result<(), Error>>().await
    };
    (task, com).race().await.unwrap();
}
