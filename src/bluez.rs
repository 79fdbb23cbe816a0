//! BlueZ implementations of the BLE capability traits, via `bluer`.
//!
//! [`BluezCentral`] backs the heart rate monitor client, [`BluezPeripheral`]
//! backs the FTMS GATT server. Everything D-Bus-flavoured stays inside this
//! module; the rest of the daemon only sees the traits in [`crate::ble`].

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicNotifier, CharacteristicRead, Service,
};
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, DiscoveryFilter};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ble::{
    AdapterState, CentralAdapter, DiscoveredDevice, GattServiceSpec, NotificationStream,
    PeripheralAdapter, PeripheralLink, PowerEventStream,
};
use crate::error::{Error, Result};

/// How long to wait for GATT service resolution after a connect.
const SERVICES_RESOLVED_TIMEOUT: Duration = Duration::from_secs(5);

fn adapter_err(e: bluer::Error) -> Error {
    Error::BleAdapterUnavailable(e.to_string())
}

fn ble_err(e: bluer::Error) -> Error {
    Error::Ble(e.to_string())
}

/// Central-role adapter over the default BlueZ adapter.
pub struct BluezCentral {
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluezCentral {
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await.map_err(adapter_err)?;
        let adapter = session.default_adapter().await.map_err(adapter_err)?;
        info!("central using BLE adapter {}", adapter.name());
        Ok(BluezCentral {
            _session: session,
            adapter,
        })
    }
}

#[async_trait]
impl CentralAdapter for BluezCentral {
    async fn wait_powered_on(&self) -> Result<()> {
        self.adapter.set_powered(true).await.map_err(adapter_err)?;
        for _ in 0..50 {
            if self.adapter.is_powered().await.map_err(adapter_err)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::BleAdapterUnavailable(
            "adapter did not power on".to_string(),
        ))
    }

    async fn scan(&self, service: Uuid, window: Duration) -> Result<Vec<DiscoveredDevice>> {
        let filter = DiscoveryFilter {
            uuids: HashSet::from([service]),
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(adapter_err)?;

        let discover = self
            .adapter
            .discover_devices()
            .await
            .map_err(adapter_err)?;
        let mut discover = Box::pin(discover);

        let mut found: HashMap<String, DiscoveredDevice> = HashMap::new();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("scan window elapsed");
                    break;
                }
                event = discover.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        if let Ok(device) = self.adapter.device(addr) {
                            let name = device.name().await.ok().flatten();
                            info!("found device {} ({:?})", addr, name);
                            found.insert(
                                addr.to_string(),
                                DiscoveredDevice { id: addr.to_string(), name },
                            );
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let mut devices: Vec<DiscoveredDevice> = found.into_values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn PeripheralLink>> {
        let address: Address = device_id
            .parse()
            .map_err(|e| Error::Ble(format!("invalid device id {device_id:?}: {e}")))?;
        let device = self.adapter.device(address).map_err(ble_err)?;

        if !device.is_connected().await.map_err(ble_err)? {
            info!("connecting to {}", address);
            device.connect().await.map_err(ble_err)?;
        }

        Ok(Box::new(BluezLink {
            id: device_id.to_string(),
            device,
        }))
    }
}

struct BluezLink {
    id: String,
    device: Device,
}

impl BluezLink {
    /// Walk the remote GATT tree for one characteristic, waiting for
    /// service resolution first.
    async fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<RemoteCharacteristic>> {
        let deadline = tokio::time::Instant::now() + SERVICES_RESOLVED_TIMEOUT;
        while !self.device.is_services_resolved().await.map_err(ble_err)? {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        for svc in self.device.services().await.map_err(ble_err)? {
            if svc.uuid().await.map_err(ble_err)? != service {
                continue;
            }
            for chr in svc.characteristics().await.map_err(ble_err)? {
                if chr.uuid().await.map_err(ble_err)? == characteristic {
                    return Ok(Some(chr));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PeripheralLink for BluezLink {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>> {
        match self.find_characteristic(service, characteristic).await? {
            Some(chr) => Ok(Some(chr.read().await.map_err(ble_err)?)),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        let chr = self
            .find_characteristic(service, characteristic)
            .await?
            .ok_or_else(|| {
                Error::BleServiceNotFound(format!(
                    "characteristic {characteristic} under service {service}"
                ))
            })?;
        let stream = chr
            .notify()
            .await
            .map_err(|e| Error::BleSubscribeFailed(e.to_string()))?;
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) -> Result<()> {
        let _ = self.device.disconnect().await;
        Ok(())
    }
}

/// Peripheral-role adapter over the default BlueZ adapter.
pub struct BluezPeripheral {
    _session: bluer::Session,
    adapter: Adapter,
    adv_handle: Mutex<Option<bluer::adv::AdvertisementHandle>>,
    app_handle: Mutex<Option<ApplicationHandle>>,
    notifiers: Arc<Mutex<HashMap<Uuid, CharacteristicNotifier>>>,
}

impl BluezPeripheral {
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await.map_err(adapter_err)?;
        let adapter = session.default_adapter().await.map_err(adapter_err)?;
        adapter.set_powered(true).await.map_err(adapter_err)?;
        info!(
            "peripheral using BLE adapter {} ({})",
            adapter.name(),
            adapter.address().await.map_err(adapter_err)?
        );
        Ok(BluezPeripheral {
            _session: session,
            adapter,
            adv_handle: Mutex::new(None),
            app_handle: Mutex::new(None),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl PeripheralAdapter for BluezPeripheral {
    async fn power_events(&self) -> Result<PowerEventStream> {
        let initial = if self.adapter.is_powered().await.map_err(adapter_err)? {
            AdapterState::PoweredOn
        } else {
            AdapterState::PoweredOff
        };
        let events = self.adapter.events().await.map_err(adapter_err)?;
        let changes = events.filter_map(|event| async move {
            match event {
                AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) => Some(if on {
                    AdapterState::PoweredOn
                } else {
                    AdapterState::PoweredOff
                }),
                _ => None,
            }
        });
        Ok(Box::pin(futures::stream::iter([initial]).chain(changes)))
    }

    async fn advertise(&self, name: &str, service: Uuid) -> Result<()> {
        let mut guard = self.adv_handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![service].into_iter().collect(),
            local_name: Some(name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        *guard = Some(self.adapter.advertise(adv).await.map_err(ble_err)?);
        info!("advertising {:?} with service {}", name, service);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        if self.adv_handle.lock().await.take().is_some() {
            info!("advertisement withdrawn");
        }
        Ok(())
    }

    async fn register_service(&self, spec: GattServiceSpec) -> Result<()> {
        let mut guard = self.app_handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut characteristics = Vec::new();
        for chr_spec in spec.characteristics {
            let mut chr = Characteristic {
                uuid: chr_spec.uuid,
                ..Default::default()
            };

            if let Some(value) = chr_spec.read_value {
                let value = Arc::new(value);
                chr.read = Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req| {
                        let value = value.clone();
                        async move {
                            debug!("characteristic read");
                            Ok((*value).clone())
                        }
                        .boxed()
                    }),
                    ..Default::default()
                });
            }

            if chr_spec.notify {
                // Stash the notifier so `notify` can push from outside the
                // GATT callback context.
                let notifiers = self.notifiers.clone();
                let uuid = chr_spec.uuid;
                let notify_fn: Box<
                    dyn Fn(
                            CharacteristicNotifier,
                        )
                            -> Pin<Box<dyn futures::Future<Output = ()> + Send>>
                        + Send
                        + Sync,
                > = Box::new(move |notifier| {
                    let notifiers = notifiers.clone();
                    async move {
                        info!(
                            "notification session started for {} (confirming={})",
                            uuid,
                            notifier.confirming()
                        );
                        notifiers.lock().await.insert(uuid, notifier);
                    }
                    .boxed()
                });
                chr.notify = Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(notify_fn),
                    ..Default::default()
                });
            }

            characteristics.push(chr);
        }

        let app = Application {
            services: vec![Service {
                uuid: spec.uuid,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };
        *guard = Some(
            self.adapter
                .serve_gatt_application(app)
                .await
                .map_err(ble_err)?,
        );
        info!("GATT application registered");
        Ok(())
    }

    async fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<bool> {
        let mut notifiers = self.notifiers.lock().await;
        let Some(notifier) = notifiers.get_mut(&characteristic) else {
            return Ok(false);
        };
        if notifier.is_stopped() {
            notifiers.remove(&characteristic);
            return Ok(false);
        }
        match notifier.notify(payload).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("notification error on {}: {}", characteristic, e);
                notifiers.remove(&characteristic);
                Ok(false)
            }
        }
    }
}
