#[cfg(target_os = "espidf")]
mod device {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use embassy_executor::Executor;
    use embassy_time::{Duration, Timer};
    use esp_idf_svc::bt::{Ble, BtDriver};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::fs::fatfs::Fatfs;
    use esp_idf_svc::hal::gpio::AnyIOPin;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::hal::sd::spi::SdSpiHostDriver;
    use esp_idf_svc::hal::sd::{SdCardConfiguration, SdCardDriver};
    use esp_idf_svc::hal::spi::config::DriverConfig;
    use esp_idf_svc::hal::spi::{Dma, SpiDriver};
    use esp_idf_svc::io::vfs::MountedFatfs;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{error, info, warn};

    use mesh_gateway::mesh_node::{self, EspMeshLink, EspMeshNode};
    use mesh_gateway::config::SD_MOUNT_POINT;
    use mesh_gateway::mqtt_client::{EspMqttLink, MqttSessionConfig};
    use mesh_gateway::nvs_store::NvsKv;
    use mesh_gateway::relay_queue::BacklogGauge;
    use mesh_gateway::wifi_client::EspWifiLink;
    use mesh_gateway::{
        ConnectivityCell, EventBus, FileLog, Gateway, GatewayConfig, GatewayRuntime, LineLog,
        MemoryLog,
    };

    const CONFIG_FILE: &str = "gateway.json";
    const SD_MAX_OPEN_FILES: usize = 5;
    const SD_DMA_BUFFER_SIZE: usize = 4096;

    type RelayLog = Box<dyn LineLog + Send>;
    type DeviceRuntime = GatewayRuntime<NvsKv, EspWifiLink, EspMqttLink, RelayLog>;

    #[embassy_executor::task]
    async fn gateway_task(mut runtime: DeviceRuntime) {
        runtime.run().await;
        error!("❌ Gateway runtime exited");
    }

    #[embassy_executor::task]
    async fn status_task(connectivity: ConnectivityCell, backlog: BacklogGauge, interval_secs: u64) {
        info!("📊 Status task started, reporting every {}s", interval_secs);
        loop {
            Timer::after(Duration::from_secs(interval_secs)).await;
            // SAFETY: plain read of the allocator's counter
            let free_heap = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
            info!(
                "📊 Connectivity: {:?}, relay backlog: {} bytes, free heap: {} bytes",
                connectivity.get(),
                backlog.bytes(),
                free_heap
            );
        }
    }

    pub fn run() -> Result<()> {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        // Bind the log crate to the ESP Logging facilities
        esp_idf_svc::log::EspLogger::initialize_default();

        info!("🚀 Starting BLE mesh gateway");

        let peripherals = Peripherals::take().context("Peripherals already taken")?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        // Removable volume holds the config file and the relay log
        let spi = SpiDriver::new(
            peripherals.spi3,
            peripherals.pins.gpio18,
            peripherals.pins.gpio23,
            Some(peripherals.pins.gpio19),
            &DriverConfig::default().dma(Dma::Auto(SD_DMA_BUFFER_SIZE)),
        )?;
        let _sdcard = match mount_sdcard(spi, peripherals.pins.gpio5.into(), SD_MOUNT_POINT) {
            Ok(mounted) => Some(mounted),
            Err(e) => {
                warn!("⚠️ SD card unavailable, relay backlog will not survive a reset: {:?}", e);
                None
            }
        };

        // Validation keeps log_dir on this volume
        let config = GatewayConfig::load_or_default(Path::new(SD_MOUNT_POINT).join(CONFIG_FILE))?;

        let relay_log: RelayLog = match FileLog::open(config.relay_log_path()) {
            Ok(log) => Box::new(log),
            Err(e) => {
                warn!("⚠️ Relay log file unavailable ({}), buffering in memory", e);
                Box::new(MemoryLog::new())
            }
        };

        let events = EventBus::new();
        let (wifi_modem, bt_modem) = peripherals.modem.split();

        let wifi = Arc::new(EspWifiLink::new(
            wifi_modem,
            sys_loop.clone(),
            nvs.clone(),
            events.clone(),
        )?);
        let mqtt = Arc::new(EspMqttLink::new(
            MqttSessionConfig {
                client_id: config.mqtt_client_id.clone(),
                keep_alive_secs: config.mqtt_keep_alive_secs,
            },
            events.clone(),
        ));

        let gateway = Gateway::build(
            &config,
            NvsKv::new(nvs.clone()),
            relay_log,
            Arc::new(EspMeshLink),
            wifi,
            mqtt,
            events,
        );
        let Gateway {
            frontend,
            runtime,
            connectivity,
        } = gateway;
        let backlog = runtime.backlog_gauge();

        // Sink goes in before the stack can raise events
        mesh_node::install_sink(move |event| frontend.on_mesh_event(event));

        let bt = BtDriver::<Ble>::new(bt_modem, Some(nvs))?;
        let _mesh = EspMeshNode::start(bt, &config.device_name)?;

        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(move |spawner| {
            if spawner.spawn(gateway_task(runtime)).is_err() {
                error!("❌ Failed to spawn gateway task");
            }
            if spawner
                .spawn(status_task(connectivity, backlog, config.status_interval_secs))
                .is_err()
            {
                error!("❌ Failed to spawn status task");
            }
        })
    }

    fn mount_sdcard(
        spi: SpiDriver<'static>,
        cs: AnyIOPin,
        mount_point: &str,
    ) -> Result<impl Sized> {
        let host = SdSpiHostDriver::new(
            spi,
            Some(cs),
            AnyIOPin::none(),
            AnyIOPin::none(),
            AnyIOPin::none(),
            None,
        )?;
        let card = SdCardDriver::new_spi(host, &SdCardConfiguration::new())?;
        let mounted = MountedFatfs::mount(Fatfs::new_sdcard(0, card)?, mount_point, SD_MAX_OPEN_FILES)?;
        info!("💾 SD card mounted at {}", mount_point);
        Ok(mounted)
    }
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    device::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("mesh-gateway drives ESP32 radios; build for an ESP-IDF target to run it");
    log::info!("The gateway library is exercised on the host through `cargo test`");
}
