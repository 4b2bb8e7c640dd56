//! BlueZ implementation of [`BleTransport`] on top of `bluer`.
//!
//! Notifications and link-loss events are forwarded by small tasks into one
//! bounded channel, so the session sees them in arrival order through
//! [`BleTransport::next_event`].

use std::collections::HashMap;
use std::time::Duration;

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::transport::{
    require_vendor_service, short_uuid, Advertisement, BleTransport, EventQueue, TransportEvent,
    DEVICE_INFO_SERVICE,
};

const EVENT_QUEUE: usize = 256;

fn adapter_err(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Adapter(e.to_string()))
}

fn connection_err(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

fn gatt_err(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Gatt(e.to_string()))
}

/// BLE central on the default BlueZ adapter.
pub struct BluezTransport {
    // Keeps the D-Bus connection alive.
    _session: Session,
    adapter: Adapter,
    discovery: Option<BoxStream<'static, AdapterEvent>>,
    device: Option<Device>,
    characteristics: HashMap<Uuid, Characteristic>,
    device_info: Vec<Characteristic>,
    events: EventQueue,
    forwarders: Vec<JoinHandle<()>>,
}

impl BluezTransport {
    /// Open the default adapter and power it on.
    pub async fn new() -> Result<Self> {
        let session = Session::new().await.map_err(adapter_err)?;
        let adapter = session.default_adapter().await.map_err(adapter_err)?;
        adapter.set_powered(true).await.map_err(adapter_err)?;
        info!("using bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            discovery: None,
            device: None,
            characteristics: HashMap::new(),
            device_info: Vec::new(),
            events: EventQueue::new(EVENT_QUEUE),
            forwarders: Vec::new(),
        })
    }

    async fn advertisement(&self, address: Address) -> Result<Advertisement> {
        let device = self.adapter.device(address).map_err(adapter_err)?;
        Ok(Advertisement {
            name: device.name().await.unwrap_or(None),
            address: address.to_string(),
            rssi: device.rssi().await.unwrap_or(None),
        })
    }

    /// Walk the GATT database once and remember the characteristics used later.
    async fn index_characteristics(&mut self, device: &Device) -> Result<()> {
        self.characteristics.clear();
        self.device_info.clear();
        let mut services = Vec::new();
        for service in device.services().await.map_err(gatt_err)? {
            let service_uuid = service.uuid().await.map_err(gatt_err)?;
            services.push(service_uuid);
            for characteristic in service.characteristics().await.map_err(gatt_err)? {
                let uuid = characteristic.uuid().await.map_err(gatt_err)?;
                debug!(
                    "service {} characteristic {}",
                    short_uuid(&service_uuid),
                    short_uuid(&uuid)
                );
                if service_uuid == DEVICE_INFO_SERVICE {
                    self.device_info.push(characteristic.clone());
                }
                self.characteristics.insert(uuid, characteristic);
            }
        }
        require_vendor_service(&services)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        if self.device.is_none() {
            return Err(BluetoothError::NotConnected.into());
        }
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| BluetoothError::MissingCharacteristic(uuid).into())
    }

    /// Forward link loss of `device` as [`TransportEvent::Disconnected`].
    async fn watch_link(&mut self, device: &Device) -> Result<()> {
        let mut events = Box::pin(device.events().await.map_err(connection_err)?);
        let tx = self.events.sender();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    debug!("link lost");
                    if tx.send(TransportEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
            }
        });
        self.forwarders.push(handle);
        Ok(())
    }

    fn abort_forwarders(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

impl BleTransport for BluezTransport {
    fn start_scan(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            let filter = DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                ..Default::default()
            };
            self.adapter
                .set_discovery_filter(filter)
                .await
                .map_err(adapter_err)?;
            let stream = self.adapter.discover_devices().await.map_err(adapter_err)?;
            self.discovery = Some(stream.boxed());
            debug!("discovery started");
            Ok(())
        }
        .boxed()
    }

    fn next_advertisement(&mut self) -> BoxFuture<'_, Result<Option<Advertisement>>> {
        async move {
            loop {
                let Some(stream) = self.discovery.as_mut() else {
                    return Ok(None);
                };
                match stream.next().await {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        return self.advertisement(address).await.map(Some);
                    }
                    Some(_) => continue,
                    None => return Ok(None),
                }
            }
        }
        .boxed()
    }

    fn stop_scan(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            // Dropping the stream ends discovery.
            if self.discovery.take().is_some() {
                debug!("discovery stopped");
            }
            Ok(())
        }
        .boxed()
    }

    fn connect<'a>(
        &'a mut self,
        device: &'a Advertisement,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let address: Address = device.address.parse().map_err(|_| {
                DriverError::Bluetooth(BluetoothError::Connection(format!(
                    "invalid address {}",
                    device.address
                )))
            })?;
            let handle = self.adapter.device(address).map_err(adapter_err)?;

            match tokio::time::timeout(timeout, handle.connect()).await {
                Err(_) => return Err(BluetoothError::ConnectTimeout(timeout).into()),
                Ok(result) => result.map_err(connection_err)?,
            }
            info!("connected to {device}");

            self.abort_forwarders();
            self.events.reset();
            if let Err(e) = self.index_characteristics(&handle).await {
                let _ = handle.disconnect().await;
                return Err(e);
            }
            self.watch_link(&handle).await?;
            self.device = Some(handle);
            Ok(())
        }
        .boxed()
    }

    fn read_device_info(&mut self) -> BoxFuture<'_, Result<Vec<(Uuid, Vec<u8>)>>> {
        async move {
            if self.device.is_none() {
                return Err(BluetoothError::NotConnected.into());
            }
            let mut values = Vec::with_capacity(self.device_info.len());
            for characteristic in &self.device_info {
                let uuid = characteristic.uuid().await.map_err(gatt_err)?;
                match characteristic.read().await {
                    Ok(value) => values.push((uuid, value)),
                    Err(e) => warn!("reading {} failed: {e}", short_uuid(&uuid)),
                }
            }
            Ok(values)
        }
        .boxed()
    }

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>>> {
        async move {
            let target = self.characteristic(characteristic)?;
            target.read().await.map_err(gatt_err)
        }
        .boxed()
    }

    fn write<'a>(&'a mut self, characteristic: Uuid, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        async move {
            let target = self.characteristic(characteristic)?;
            let request = CharacteristicWriteRequest {
                op_type: WriteOp::Request,
                ..Default::default()
            };
            target.write_ext(data, &request).await.map_err(gatt_err)
        }
        .boxed()
    }

    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<()>> {
        async move {
            let target = self.characteristic(characteristic)?.clone();
            let mut notifications = Box::pin(target.notify().await.map_err(gatt_err)?);
            let tx = self.events.sender();
            let handle = tokio::spawn(async move {
                while let Some(value) = notifications.next().await {
                    if tx.send(TransportEvent::Notification(value)).await.is_err() {
                        break;
                    }
                }
                debug!("notification stream closed");
            });
            self.forwarders.push(handle);
            debug!("subscribed to {}", short_uuid(&characteristic));
            Ok(())
        }
        .boxed()
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        self.events.next().boxed()
    }

    fn clear_disconnect(&mut self) {
        self.events.clear_disconnect();
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.abort_forwarders();
            self.characteristics.clear();
            self.device_info.clear();
            match self.device.take() {
                Some(device) => device.disconnect().await.map_err(connection_err),
                None => Ok(()),
            }
        }
        .boxed()
    }
}
