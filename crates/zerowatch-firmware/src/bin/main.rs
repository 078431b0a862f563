#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

#[cfg(all(feature = "provisioning-mode", feature = "delete-provisioning"))]
compile_error!("`provisioning-mode` and `delete-provisioning` are mutually exclusive");

use alloc::string::ToString;

use embassy_executor::Spawner;
use embassy_futures::join::join3;
use embassy_net::Stack;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::timer::timg::TimerGroup;
use log::{LevelFilter, info, warn};

use zerowatch_core::app_state::{AppError, AppState, DeviceContext, Severity};
use zerowatch_core::otp::OtpGate;
use zerowatch_core::provisioning::{ProvisioningRecord, ProvisioningStore};
use zerowatch_core::store::{KeyValueStore, RespClient};
use zerowatch_firmware::sd_region::{FixedClock, SdRegion};
use zerowatch_firmware::{NoOta, halt, hardware, net};

/// Pause between store connection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Socket buffer size, each direction
const STORE_BUFFER: usize = 1024;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!(LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("zerowatch {} starting", env!("CARGO_PKG_VERSION"));

    let i2c = hardware::create_i2c_bus(peripherals.I2C0, peripherals.GPIO12, peripherals.GPIO11)
        .unwrap_or_else(|e| halt(&e));
    if let Err(e) = hardware::power_up(i2c).await {
        halt(&e);
    }

    let sd_card = hardware::init_sd_card(
        peripherals.SPI2,
        peripherals.GPIO36,
        peripherals.GPIO37,
        peripherals.GPIO35,
        peripherals.GPIO4,
    )
    .unwrap_or_else(|e| halt(&e));
    let region = SdRegion::open(sd_card, FixedClock)
        .unwrap_or_else(|e| halt(&format_args!("sd card: {:?}", e)));
    let mut provisioning = ProvisioningStore::new(region).unwrap_or_else(|e| halt(&e));

    #[cfg(feature = "delete-provisioning")]
    {
        use zerowatch_firmware::provisioning_mode;

        provisioning_mode::operator_abort_window("erasing provisioning").await;
        match provisioning.erase() {
            Ok(()) => halt(&"provisioning erased"),
            Err(e) => halt(&e),
        }
    }

    #[cfg(feature = "provisioning-mode")]
    {
        use zerowatch_firmware::provisioning_mode;

        let record = provisioning_mode::operator_record();
        info!("provisioning {:?}", record);
        provisioning_mode::operator_abort_window("writing provisioning").await;
        match provisioning.write(&record) {
            Ok(()) => halt(&"provisioning written and verified"),
            Err(e) => halt(&e),
        }
    }

    let record = provisioning.boot().unwrap_or_else(|e| halt(&e));
    let device = DeviceContext::new(record, OtpGate::default()).unwrap_or_else(|e| halt(&e));
    let credentials = device.credentials().clone();

    let (mut controller, stack, mut runner) = net::init(
        peripherals.WIFI,
        &credentials.wifi_ssid,
        &credentials.wifi_password,
    )
    .unwrap_or_else(|e| halt(&e));

    let mut app = AppState::new(device, NoOta);

    let net_future = runner.run();
    let wifi_future = net::connection_loop(&mut controller, stack);
    let store_future = store_loop(stack, &mut app, &credentials);
    let _ = join3(net_future, wifi_future, store_future).await;

    halt(&"main loop exited")
}

/// Connect to the backend store and run sessions until a fatal error
async fn store_loop(
    stack: Stack<'_>,
    app: &mut AppState<NoOta>,
    credentials: &ProvisioningRecord,
) -> ! {
    let mut rx_buffer = [0u8; STORE_BUFFER];
    let mut tx_buffer = [0u8; STORE_BUFFER];

    loop {
        stack.wait_config_up().await;

        let e = connect_and_run(stack, app, credentials, &mut rx_buffer, &mut tx_buffer).await;
        match e.severity() {
            Severity::Fatal => halt(&e),
            _ => warn!("store session ended: {}", e),
        }

        Timer::after(RECONNECT_DELAY).await;
    }
}

/// One connection: connect, authenticate, then run a session on it
async fn connect_and_run(
    stack: Stack<'_>,
    app: &mut AppState<NoOta>,
    credentials: &ProvisioningRecord,
    rx_buffer: &mut [u8],
    tx_buffer: &mut [u8],
) -> AppError {
    let socket = match net::connect_store(
        stack,
        &credentials.backend_host,
        credentials.backend_port,
        rx_buffer,
        tx_buffer,
    )
    .await
    {
        Ok(socket) => socket,
        Err(e) => return AppError::Network(e.to_string()),
    };

    let mut store = RespClient::new(socket);
    let e = match store.auth(&credentials.backend_password).await {
        Ok(()) => session(app, &mut store).await,
        Err(e) => AppError::Store(e),
    };
    store.into_inner().close();
    e
}

/// Poll until the store fails; the error decides what happens next
async fn session<S: KeyValueStore>(app: &mut AppState<NoOta>, store: &mut S) -> AppError {
    if let Err(e) = app.start(store).await {
        return e;
    }

    loop {
        match app.cycle(store, Instant::now()).await {
            Ok(report) => {
                if report.restart {
                    info!("update staged, restarting");
                    Timer::after(Duration::from_secs(1)).await;
                    esp_hal::system::software_reset();
                }
                Timer::after(report.config.refresh_interval()).await;
            }
            Err(e) => return e,
        }
    }
}
