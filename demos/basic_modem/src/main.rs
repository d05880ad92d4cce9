use std::time::Duration;
use futures_concurrency::future::Race;
use atchannel::{
    channel::{Channel, ChannelConfig, Error},
    transport::SerialConfig,
    modem::wake_up,
    };

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    println!("opening modem");
    let channel = Channel::open(&SerialConfig::new("/dev/ttyUSB2", 115_200), ChannelConfig::default()).unwrap();
    channel.subscribe(|notification| println!("notification {:?}", notification.lines));

    let task = async {
        wake_up(&channel, 10, Duration::from_millis(300)).await?;
        for line in channel.command("ATI").await?.into_result()? {
            println!("    {}", line);
        }
        for _ in 0 .. 10 {
            let quality = channel.query("AT+CSQ", "+CSQ:").await?;
            match quality.value("+CSQ:") {
                Some(value) => println!("signal quality {}", value),
                None => println!("no signal quality {:?}", quality.error),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        channel.close().await
    };
    let com = async {
        channel.run().await?;
        // closed by the task
        std::future::pending::<Result<(), Error>>().await
    };
    (task, com).race().await.unwrap();
}
