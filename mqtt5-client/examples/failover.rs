use std::error::Error;
use std::time::Duration;

use mqtt5_client::{AsyncClient, LastWill, OptionBuilder, QoS};
use tokio::task;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    // The client rotates through the listed brokers. A backoff only kicks in
    // after the whole list was tried without success.
    let will = LastWill::new("state/failover-demo", "offline", QoS::AtLeastOnce, true);
    let options = OptionBuilder::new_tcp("broker1:1883, broker2, broker3:1884", 1883)
        .client_id("failover-demo")
        .keep_alive(Duration::from_secs(30))
        .clean_start(false)
        .session_expiry_interval(300)
        .last_will(will)
        .topic_aliases_out(true)
        .finalize();

    let (client, eventloop) = AsyncClient::new(options, 10);
    task::spawn(eventloop.run());

    client
        .publish("state/failover-demo", QoS::AtLeastOnce, true, "online")
        .await?;

    loop {
        let message = client.receive().await?;
        println!("{}: {:?}", message.topic, message.payload);
    }
}
