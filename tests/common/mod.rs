//! In-memory BLE adapters for scenario tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use waterrower_daemon::ble::{
    AdapterState, CentralAdapter, DiscoveredDevice, GattServiceSpec, NotificationStream,
    PeripheralAdapter, PeripheralLink, PowerEventStream, BATTERY_LEVEL_UUID,
    BATTERY_SERVICE_UUID, DEVICE_NAME_UUID, GAP_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use waterrower_daemon::error::{Error, Result};

/// How `MockCentral::connect` behaves.
#[derive(Clone)]
pub enum MockConnect {
    /// Fail immediately.
    Fail,
    /// Never resolve (forces the caller's timeout).
    Hang,
    /// Hand out a link to this device.
    Device(MockDevice),
}

/// GATT shape of a mocked heart rate monitor.
#[derive(Clone, Default)]
pub struct MockDevice {
    pub name: Option<String>,
    pub battery: Option<u8>,
    pub hr_characteristic: bool,
}

pub struct MockCentral {
    connect_behavior: StdMutex<MockConnect>,
    scan_results: StdMutex<Vec<DiscoveredDevice>>,
    connect_attempts: AtomicUsize,
    notify_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MockCentral {
    pub fn new(behavior: MockConnect) -> Arc<Self> {
        Arc::new(MockCentral {
            connect_behavior: StdMutex::new(behavior),
            scan_results: StdMutex::new(Vec::new()),
            connect_attempts: AtomicUsize::new(0),
            notify_tx: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn with_scan_results(self: Arc<Self>, devices: Vec<DiscoveredDevice>) -> Arc<Self> {
        *self.scan_results.lock().unwrap() = devices;
        self
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Push a heart rate notification to the subscribed client.
    pub fn send_notification(&self, data: Vec<u8>) {
        let guard = self.notify_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(data);
        }
    }

    /// Drop the notification channel, ending the subscribed stream as a
    /// transport would on disconnect.
    pub fn drop_notifications(&self) {
        self.notify_tx.lock().unwrap().take();
    }
}

#[async_trait]
impl CentralAdapter for MockCentral {
    async fn wait_powered_on(&self) -> Result<()> {
        Ok(())
    }

    async fn scan(&self, _service: Uuid, _window: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.scan_results.lock().unwrap().clone())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn PeripheralLink>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self.connect_behavior.lock().unwrap().clone();
        match behavior {
            MockConnect::Fail => Err(Error::Ble("mock connect refused".to_string())),
            MockConnect::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            MockConnect::Device(spec) => Ok(Box::new(MockLink {
                id: device_id.to_string(),
                spec,
                notify_tx: self.notify_tx.clone(),
            })),
        }
    }
}

struct MockLink {
    id: String,
    spec: MockDevice,
    notify_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

#[async_trait]
impl PeripheralLink for MockLink {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Vec<u8>>> {
        if service == GAP_SERVICE_UUID && characteristic == DEVICE_NAME_UUID {
            return Ok(self.spec.name.as_ref().map(|n| n.as_bytes().to_vec()));
        }
        if service == BATTERY_SERVICE_UUID && characteristic == BATTERY_LEVEL_UUID {
            return Ok(self.spec.battery.map(|b| vec![b]));
        }
        Ok(None)
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        if service == HEART_RATE_SERVICE_UUID
            && characteristic == HEART_RATE_MEASUREMENT_UUID
            && self.spec.hr_characteristic
        {
            let (tx, mut rx) = mpsc::unbounded_channel();
            *self.notify_tx.lock().unwrap() = Some(tx);
            let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
            return Ok(Box::pin(stream));
        }
        Err(Error::BleServiceNotFound(format!(
            "characteristic {characteristic} under service {service}"
        )))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Peripheral adapter that records everything and lets the test drive
/// power transitions.
pub struct MockPeripheral {
    pub subscribed: AtomicBool,
    notifications: StdMutex<Vec<(Uuid, Vec<u8>)>>,
    advertise_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    registered: StdMutex<Vec<GattServiceSpec>>,
    power_tx: StdMutex<Option<mpsc::UnboundedSender<AdapterState>>>,
}

impl MockPeripheral {
    pub fn new(subscribed: bool) -> Arc<Self> {
        Arc::new(MockPeripheral {
            subscribed: AtomicBool::new(subscribed),
            notifications: StdMutex::new(Vec::new()),
            advertise_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            registered: StdMutex::new(Vec::new()),
            power_tx: StdMutex::new(None),
        })
    }

    pub fn push_power(&self, state: AdapterState) {
        let guard = self.power_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(state);
        }
    }

    pub fn close_power_events(&self) {
        self.power_tx.lock().unwrap().take();
    }

    /// Whether a `run` loop has subscribed to power events yet.
    pub fn power_listener_attached(&self) -> bool {
        self.power_tx.lock().unwrap().is_some()
    }

    pub fn notifications(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn advertise_calls(&self) -> usize {
        self.advertise_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn registered_services(&self) -> Vec<GattServiceSpec> {
        self.registered.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeripheralAdapter for MockPeripheral {
    async fn power_events(&self) -> Result<PowerEventStream> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.power_tx.lock().unwrap() = Some(tx);
        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(stream))
    }

    async fn advertise(&self, _name: &str, _service: Uuid) -> Result<()> {
        self.advertise_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_service(&self, service: GattServiceSpec) -> Result<()> {
        self.registered.lock().unwrap().push(service);
        Ok(())
    }

    async fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<bool> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.notifications
            .lock()
            .unwrap()
            .push((characteristic, payload));
        Ok(true)
    }
}

/// Poll `predicate` while yielding to the runtime, asserting it holds
/// within a bounded number of scheduler passes.
pub async fn eventually(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true: {what}");
}
