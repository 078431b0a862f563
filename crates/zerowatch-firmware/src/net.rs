//! Wi-Fi station bring-up and the TCP connection to the backend store

use alloc::format;
use alloc::string::String;

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{
    Config as NetConfig, DhcpConfig, IpAddress, IpEndpoint, Ipv4Address, Runner, Stack,
    StackResources,
};
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice, WifiEvent};
use log::{info, warn};
use static_cell::StaticCell;
use thiserror_no_std::Error;

use crate::socket::StoreSocket;

/// Socket timeout; a stalled store connection is dropped after this
pub const STORE_TIMEOUT: Duration = Duration::from_secs(10);

const WIFI_RETRY_DELAY: Duration = Duration::from_secs(5);

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();

#[derive(Error, Debug)]
pub enum NetError {
    #[error("wifi: {0}")]
    Wifi(String),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("connect: {0}")]
    Connect(String),
}

pub type NetParts = (
    WifiController<'static>,
    Stack<'static>,
    Runner<'static, WifiDevice<'static>>,
);

/// Bring up the radio, configure the station and create the IP stack.
///
/// Nothing happens on air until the returned runner and
/// [`connection_loop`] are polled.
pub fn init(wifi: WIFI<'static>, ssid: &str, password: &str) -> Result<NetParts, NetError> {
    let radio = esp_radio::init().map_err(|e| NetError::Wifi(format!("{:?}", e)))?;
    let radio = RADIO.init(radio);
    let (mut controller, interfaces) = esp_radio::wifi::new(radio, wifi, Default::default())
        .map_err(|e| NetError::Wifi(format!("{:?}", e)))?;

    let mode = ModeConfig::Client(
        ClientConfig::default()
            .with_ssid(String::from(ssid))
            .with_password(String::from(password)),
    );
    controller
        .set_config(&mode)
        .map_err(|e| NetError::Wifi(format!("{:?}", e)))?;

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(DhcpConfig::default()),
        NET_RESOURCES.init(StackResources::<4>::new()),
        seed,
    );
    Ok((controller, stack, runner))
}

/// Keep the station associated, reconnecting after every drop
pub async fn connection_loop(controller: &mut WifiController<'_>, stack: Stack<'_>) -> ! {
    loop {
        if !matches!(controller.is_started(), Ok(true)) {
            info!("wifi: starting station");
            if let Err(e) = controller.start_async().await {
                warn!("wifi: start failed: {:?}", e);
                Timer::after(WIFI_RETRY_DELAY).await;
                continue;
            }
        }

        match controller.connect_async().await {
            Ok(()) => {
                stack.wait_config_up().await;
                if let Some(config) = stack.config_v4() {
                    info!("wifi: up, address {}", config.address.address());
                }
                controller.wait_for_event(WifiEvent::StaDisconnected).await;
                warn!("wifi: disconnected");
            }
            Err(e) => warn!("wifi: connect failed: {:?}", e),
        }
        Timer::after(WIFI_RETRY_DELAY).await;
    }
}

/// Resolve a dotted quad directly, anything else through DNS
async fn resolve(stack: Stack<'_>, host: &str) -> Result<IpAddress, NetError> {
    if let Ok(addr) = host.parse::<Ipv4Address>() {
        return Ok(IpAddress::Ipv4(addr));
    }
    let answers = stack
        .dns_query(host, DnsQueryType::A)
        .await
        .map_err(|e| NetError::Resolve(format!("{} ({:?})", host, e)))?;
    answers
        .first()
        .copied()
        .ok_or_else(|| NetError::Resolve(String::from(host)))
}

/// Open a TCP connection to the backend store
pub async fn connect_store<'a>(
    stack: Stack<'a>,
    host: &str,
    port: u16,
    rx_buffer: &'a mut [u8],
    tx_buffer: &'a mut [u8],
) -> Result<StoreSocket<'a>, NetError> {
    let address = resolve(stack, host).await?;

    let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
    socket.set_timeout(Some(STORE_TIMEOUT));
    socket
        .connect(IpEndpoint::new(address, port))
        .await
        .map_err(|e| NetError::Connect(format!("{}:{} ({:?})", host, port, e)))?;

    info!("net: connected to store at {}:{}", host, port);
    Ok(StoreSocket::new(socket))
}
