//! Zone transfers over TCP, attempted only in active mode against name
//! servers discovered for a subdomain.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::proto::iocompat::AsyncIoTokioAsStd;
use hickory_client::rr::{DNSClass, Name, RecordType};
use hickory_client::tcp::TcpClientStream;
use tokio::net::TcpStream;

use crate::dns::pool::answer_from_record;
use crate::types::DnsAnswer;

pub const AXFR_TIMEOUT: Duration = Duration::from_secs(10);

/// Pull every resource record of `zone` from one name server. Most servers
/// refuse; a refusal or timeout is an ordinary failure, not an error worth
/// surfacing past the caller's log line.
pub async fn zone_transfer(
    zone: &str,
    server: SocketAddr,
    timeout: Duration,
) -> anyhow::Result<Vec<DnsAnswer>> {
    let transfer = async {
        let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(server);
        let (mut client, background) = AsyncClient::new(stream, sender, None).await?;
        tokio::spawn(background);

        let name = Name::from_ascii(zone)?;
        let response = client.query(name, DNSClass::IN, RecordType::AXFR).await?;
        let answers = response
            .answers()
            .iter()
            .filter_map(answer_from_record)
            .collect::<Vec<_>>();
        Ok::<_, anyhow::Error>(answers)
    };

    match tokio::time::timeout(timeout, transfer).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("zone transfer of {zone} from {server} timed out"),
    }
}
