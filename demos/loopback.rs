//! Master and slave talking over loopback.
//!
//! The slave answers "read holding registers" queries with the register
//! address echoed back; every other function code gets an "illegal
//! function" exception.
//!
//! Run with: `cargo run --example loopback`

use std::time::Duration;

use mbap_transport::{Answer, MasterConfig, MasterTransport, Query, SlaveConfig, SlaveTransport};

const READ_HOLDING_REGISTERS: u8 = 0x03;
const ILLEGAL_FUNCTION: u8 = 0x01;

fn respond(query: &Query) -> Answer {
    if query.function_code != READ_HOLDING_REGISTERS || query.data.len() < 2 {
        return Answer::new(query.function_code | 0x80, vec![ILLEGAL_FUNCTION]);
    }
    Answer::new(query.function_code, vec![0x02, query.data[0], query.data[1]])
}

#[tokio::main]
async fn main() -> mbap_transport::Result<()> {
    let slave = SlaveTransport::bind(
        SlaveConfig::new()
            .with_address("127.0.0.1")
            .with_port(0)
            .with_parallel(8),
    )
    .await?;
    println!("slave listening on {}", slave.local_addr());

    let server = async {
        while let Ok(transaction) = slave.poll().await {
            let answer = respond(transaction.query());
            transaction.answer(answer);
        }
    };

    let master = MasterTransport::new(
        MasterConfig::new("127.0.0.1")
            .with_port(slave.local_addr().port())
            .with_establish_timeout(Duration::from_secs(1))
            .with_parallel(4),
    )?;

    let client = async {
        for address in 0u8..4 {
            let query = Query::new(1, READ_HOLDING_REGISTERS, vec![0x00, address, 0x00, 0x01]);
            match master.query(&query, false).await? {
                Some(answer) => println!("register {}: {:02x?}", address, &answer.data[..]),
                None => println!("register {}: no answer", address),
            }
        }

        let query = Query::new(1, 0x2B, vec![0x0E, 0x01, 0x00]);
        if let Some(answer) = master.query(&query, false).await? {
            println!("function 0x2b: exception {}", answer.is_exception());
        }

        master.close(false);
        master.wait().await;
        slave.close(false);
        mbap_transport::Result::Ok(())
    };

    let (result, ()) = tokio::join!(client, server);
    slave.wait().await;
    result
}
