//! Modbus/TCP server in front of the register map
//!
//! Every request is answered straight from the shared [`RegisterMap`]; the
//! server never waits for the control loop. The map only guarantees
//! per-address consistency by default, so a master reading several
//! registers at once may see values from two different ticks.
//!
//! Besides the register functions the server answers read device
//! identification (function 43, MEI type 14) from [`IdentityConfig`].

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::bytes::Bytes;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_modbus::{ExceptionCode, Request, Response};

use crate::config::IdentityConfig;
use crate::control::Shutdown;
use crate::error::PlantError;
use crate::registers::{RegisterError, RegisterMap};

/// Protocol limits on the quantity of a single request
const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_REGISTERS: u16 = 123;
const MAX_READ_BITS: u16 = 2000;
const MAX_WRITE_BITS: u16 = 1968;

fn check_quantity(quantity: usize, max: u16) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > max as usize {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

/// Encapsulated interface transport
const FN_ENCAPSULATED: u8 = 0x2B;
/// MEI type of read device identification
const MEI_READ_DEVICE_ID: u8 = 0x0E;
/// Regular identification with stream and individual access
const CONFORMITY_LEVEL: u8 = 0x82;
/// Object bytes left in a response PDU after its 7-byte header
const MAX_OBJECTS_LEN: usize = 246;
/// Longest object value that fits a response on its own
pub const MAX_OBJECT_LEN: usize = MAX_OBJECTS_LEN - 2;

fn exception(err: RegisterError) -> ExceptionCode {
    log::warn!("Field-bus: rejected request: {}", err);
    ExceptionCode::IllegalDataAddress
}

/// Identification objects served through function 43/14
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Ascending by object id
    objects: Vec<(u8, Vec<u8>)>,
}

impl DeviceIdentity {
    pub fn from_config(config: &IdentityConfig) -> Self {
        let objects = config
            .objects()
            .into_iter()
            .filter(|&(id, value)| id <= 0x02 || !value.is_empty())
            .map(|(id, value)| {
                let bytes = value.as_bytes();
                (id, bytes[..bytes.len().min(MAX_OBJECT_LEN)].to_vec())
            })
            .collect();
        Self { objects }
    }

    pub fn object(&self, id: u8) -> Option<&[u8]> {
        self.objects
            .iter()
            .find(|(object_id, _)| *object_id == id)
            .map(|(_, value)| value.as_slice())
    }

    /// Answer a read device identification request
    ///
    /// `data` is the request PDU after the function code: MEI type, read
    /// device id code and object id. Stream access (codes 1 to 3) returns the
    /// objects of the category from the requested id on, restarting at 0 for
    /// an unknown id, and flags "more follows" when they do not fit one
    /// response. Code 4 returns exactly the requested object.
    pub fn read(&self, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        if data.first() != Some(&MEI_READ_DEVICE_ID) {
            return Err(ExceptionCode::IllegalFunction);
        }
        let &[_, code, object_id] = data else {
            return Err(ExceptionCode::IllegalDataValue);
        };

        let selected: Vec<(u8, &[u8])> = match code {
            1..=3 => {
                let last = match code {
                    1 => 0x02,
                    2 => 0x7F,
                    _ => 0xFF,
                };
                let start = if object_id <= last && self.object(object_id).is_some() {
                    object_id
                } else {
                    0
                };
                self.objects
                    .iter()
                    .filter(|(id, _)| (start..=last).contains(id))
                    .map(|(id, value)| (*id, value.as_slice()))
                    .collect()
            }
            4 => {
                let value = self
                    .object(object_id)
                    .ok_or(ExceptionCode::IllegalDataAddress)?;
                vec![(object_id, value)]
            }
            _ => return Err(ExceptionCode::IllegalDataValue),
        };

        let mut response = vec![MEI_READ_DEVICE_ID, code, CONFORMITY_LEVEL, 0x00, 0x00, 0];
        let mut used = 0;
        let mut count = 0u8;
        for (id, value) in selected {
            if used + 2 + value.len() > MAX_OBJECTS_LEN {
                response[3] = 0xFF;
                response[4] = id;
                break;
            }
            response.push(id);
            response.push(value.len() as u8);
            response.extend_from_slice(value);
            used += 2 + value.len();
            count += 1;
        }
        response[5] = count;
        Ok(response)
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::from_config(&IdentityConfig::default())
    }
}

/// One master's view of the register map
#[derive(Debug, Clone)]
pub struct RegisterService {
    registers: Arc<RegisterMap>,
    identity: Arc<DeviceIdentity>,
}

impl RegisterService {
    pub fn new(registers: Arc<RegisterMap>) -> Self {
        Self {
            registers,
            identity: Arc::new(DeviceIdentity::default()),
        }
    }

    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Arc::new(identity);
        self
    }

    /// Answer a single request
    pub fn handle(&self, req: Request<'_>) -> Result<Response, ExceptionCode> {
        let registers = &self.registers;

        match req {
            Request::ReadCoils(address, count) => {
                check_quantity(count as usize, MAX_READ_BITS)?;
                registers
                    .coils(address, count)
                    .map(Response::ReadCoils)
                    .map_err(exception)
            }
            Request::ReadDiscreteInputs(address, count) => {
                check_quantity(count as usize, MAX_READ_BITS)?;
                registers
                    .discrete_inputs(address, count)
                    .map(Response::ReadDiscreteInputs)
                    .map_err(exception)
            }
            Request::ReadHoldingRegisters(address, count) => {
                check_quantity(count as usize, MAX_READ_REGISTERS)?;
                log::trace!("Field-bus: read {} holding registers at {}", count, address);
                registers
                    .get(address, count)
                    .map(Response::ReadHoldingRegisters)
                    .map_err(exception)
            }
            Request::ReadInputRegisters(address, count) => {
                check_quantity(count as usize, MAX_READ_REGISTERS)?;
                registers
                    .input_registers(address, count)
                    .map(Response::ReadInputRegisters)
                    .map_err(exception)
            }
            Request::WriteSingleCoil(address, value) => registers
                .set_coils(address, &[value])
                .map(|()| Response::WriteSingleCoil(address, value))
                .map_err(exception),
            Request::WriteMultipleCoils(address, values) => {
                check_quantity(values.len(), MAX_WRITE_BITS)?;
                registers
                    .set_coils(address, &values)
                    .map(|()| Response::WriteMultipleCoils(address, values.len() as u16))
                    .map_err(exception)
            }
            Request::WriteSingleRegister(address, value) => {
                log::debug!("Field-bus: write {} = {}", address, value);
                registers
                    .set(address, &[value])
                    .map(|()| Response::WriteSingleRegister(address, value))
                    .map_err(exception)
            }
            Request::WriteMultipleRegisters(address, values) => {
                check_quantity(values.len(), MAX_WRITE_REGISTERS)?;
                log::debug!("Field-bus: write {} = {:?}", address, values);
                registers
                    .set(address, &values)
                    .map(|()| Response::WriteMultipleRegisters(address, values.len() as u16))
                    .map_err(exception)
            }
            Request::ReadWriteMultipleRegisters(read_address, count, write_address, values) => {
                check_quantity(count as usize, MAX_READ_REGISTERS)?;
                check_quantity(values.len(), MAX_WRITE_REGISTERS)?;
                // The write happens before the read
                registers.set(write_address, &values).map_err(exception)?;
                registers
                    .get(read_address, count)
                    .map(Response::ReadWriteMultipleRegisters)
                    .map_err(exception)
            }
            Request::Custom(FN_ENCAPSULATED, data) => {
                log::debug!("Field-bus: device identification {:02x?}", data);
                self.identity
                    .read(&data)
                    .map(|pdu| Response::Custom(FN_ENCAPSULATED, Bytes::from(pdu)))
            }
            other => {
                log::warn!("Field-bus: unsupported request {:?}", other);
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}

/// Open the listener; failure is a configuration fault
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, PlantError> {
    let listener = TcpListener::bind((host, port)).await.map_err(|e| {
        PlantError::Configuration(format!("cannot listen on {}:{}: {}", host, port, e))
    })?;
    if let Ok(addr) = listener.local_addr() {
        log::info!("Field-bus: listening on {}", addr);
    }
    Ok(listener)
}

/// Serve masters until the control loop signals a stop
///
/// Every connection gets a clone of `service`; clones share the map.
pub async fn serve(
    listener: TcpListener,
    service: RegisterService,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let server = Server::new(listener);

    let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
        let service = service.clone();
        async move {
            accept_tcp_connection(stream, socket_addr, move |peer| {
                log::info!("Field-bus: master connected from {}", peer);
                Ok(Some(service.clone()))
            })
        }
    };
    let on_process_error = |err| {
        log::warn!("Field-bus: connection error: {}", err);
    };

    tokio::select! {
        result = server.serve(&on_connected, on_process_error) => result,
        _ = shutdown.fieldbus_stopped() => {
            log::info!("Field-bus: server stopped");
            Ok(())
        }
    }
}
