use std::error::Error;
use std::time::Duration;

use mqtt5_client::{AsyncClient, OptionBuilder, QoS};
use tokio::{task, time};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let options = OptionBuilder::new_tcp("localhost:1883", 1883)
        .client_id("test-1")
        .keep_alive(Duration::from_secs(5))
        .finalize();

    let (client, eventloop) = AsyncClient::new(options, 10);
    task::spawn(eventloop.run());

    let ack = client.subscribe("hello/world", QoS::AtLeastOnce).await?;
    println!("Subscribed: {:?}", ack.reason_codes);

    task::spawn({
        let client = client.clone();
        async move {
            for i in 1..=10usize {
                let ack = client
                    .publish("hello/world", QoS::ExactlyOnce, false, vec![1; i])
                    .await;
                println!("Published: {ack:?}");
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    for _ in 0..10 {
        let message = client.receive().await?;
        println!("Received on {}: {} bytes", message.topic, message.payload.len());
    }

    client.disconnect().await?;
    Ok(())
}
