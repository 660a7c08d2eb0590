//! VISA resource strings.
//!
//! Supports the forms found on the bench:
//! - `USB0::0x2A8D::0x1002::MY61005055::0::INSTR` (USBTMC, interface number optional)
//! - `TCPIP0::192.168.1.20::inst0::INSTR` / `TCPIP0::host::hislip0::INSTR` (VXI-11, HiSLIP)
//! - `TCPIP0::192.168.1.20::5025::SOCKET` (raw SCPI socket)
//! - `GPIB0::7::INSTR`
//! - `ASRL3::INSTR` / `ASRL/dev/ttyUSB0::INSTR`

use crate::error::{BenchError, BenchResult};
use std::fmt;
use std::str::FromStr;

/// Conventional raw-socket SCPI port
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// A parsed VISA resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisaResource {
    Usb {
        board: u16,
        vendor_id: u16,
        product_id: u16,
        serial: String,
        interface: Option<u16>,
    },
    TcpipInstr {
        board: u16,
        host: String,
        device: String,
    },
    TcpipSocket {
        board: u16,
        host: String,
        port: u16,
    },
    Gpib {
        board: u16,
        address: u8,
    },
    Serial {
        port: String,
    },
}

impl VisaResource {
    /// True when the resource can be reached without a system VISA library.
    pub fn is_raw_socket(&self) -> bool {
        matches!(self, VisaResource::TcpipSocket { .. })
    }

    /// Short interface name for logging.
    pub fn interface_name(&self) -> &'static str {
        match self {
            VisaResource::Usb { .. } => "USB",
            VisaResource::TcpipInstr { .. } | VisaResource::TcpipSocket { .. } => "TCPIP",
            VisaResource::Gpib { .. } => "GPIB",
            VisaResource::Serial { .. } => "ASRL",
        }
    }
}

fn board_number(prefix: &str, head: &str) -> Option<u16> {
    let digits = &head[prefix.len()..];
    if digits.is_empty() {
        Some(0)
    } else {
        digits.parse().ok()
    }
}

fn parse_id(text: &str) -> Option<u16> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl FromStr for VisaResource {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BenchError::InvalidInput(format!("Unsupported VISA resource '{s}'"));
        let upper = s.trim().to_uppercase();
        let parts: Vec<&str> = s.trim().split("::").collect();
        let head = parts.first().map(|p| p.to_uppercase()).unwrap_or_default();
        let class = parts.last().map(|p| p.to_uppercase()).unwrap_or_default();

        if head.starts_with("USB") {
            if class != "INSTR" || !(parts.len() == 5 || parts.len() == 6) {
                return Err(invalid());
            }
            let interface = if parts.len() == 6 {
                Some(parts[4].parse().map_err(|_| invalid())?)
            } else {
                None
            };
            return Ok(VisaResource::Usb {
                board: board_number("USB", &head).ok_or_else(invalid)?,
                vendor_id: parse_id(parts[1]).ok_or_else(invalid)?,
                product_id: parse_id(parts[2]).ok_or_else(invalid)?,
                serial: parts[3].to_string(),
                interface,
            });
        }

        if head.starts_with("TCPIP") {
            let board = board_number("TCPIP", &head).ok_or_else(invalid)?;
            return match (parts.len(), class.as_str()) {
                (4, "SOCKET") => Ok(VisaResource::TcpipSocket {
                    board,
                    host: parts[1].to_string(),
                    port: parts[2].parse().map_err(|_| invalid())?,
                }),
                (3, "INSTR") => Ok(VisaResource::TcpipInstr {
                    board,
                    host: parts[1].to_string(),
                    device: "inst0".to_string(),
                }),
                (4, "INSTR") => Ok(VisaResource::TcpipInstr {
                    board,
                    host: parts[1].to_string(),
                    device: parts[2].to_string(),
                }),
                _ => Err(invalid()),
            };
        }

        if head.starts_with("GPIB") {
            if parts.len() != 3 || class != "INSTR" {
                return Err(invalid());
            }
            return Ok(VisaResource::Gpib {
                board: board_number("GPIB", &head).ok_or_else(invalid)?,
                address: parts[1].parse().map_err(|_| invalid())?,
            });
        }

        if upper.starts_with("ASRL") && parts.len() == 2 && class == "INSTR" {
            return Ok(VisaResource::Serial {
                port: parts[0][4..].to_string(),
            });
        }

        Err(invalid())
    }
}

impl fmt::Display for VisaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisaResource::Usb {
                board,
                vendor_id,
                product_id,
                serial,
                interface,
            } => {
                write!(f, "USB{board}::0x{vendor_id:04X}::0x{product_id:04X}::{serial}")?;
                if let Some(intf) = interface {
                    write!(f, "::{intf}")?;
                }
                write!(f, "::INSTR")
            }
            VisaResource::TcpipInstr { board, host, device } => {
                write!(f, "TCPIP{board}::{host}::{device}::INSTR")
            }
            VisaResource::TcpipSocket { board, host, port } => {
                write!(f, "TCPIP{board}::{host}::{port}::SOCKET")
            }
            VisaResource::Gpib { board, address } => write!(f, "GPIB{board}::{address}::INSTR"),
            VisaResource::Serial { port } => write!(f, "ASRL{port}::INSTR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_with_interface() {
        let res: VisaResource = "USB0::0x2A8D::0x1002::MY61005055::0::INSTR".parse().unwrap();
        assert_eq!(
            res,
            VisaResource::Usb {
                board: 0,
                vendor_id: 0x2A8D,
                product_id: 0x1002,
                serial: "MY61005055".to_string(),
                interface: Some(0),
            }
        );
        assert_eq!(res.to_string(), "USB0::0x2A8D::0x1002::MY61005055::0::INSTR");
    }

    #[test]
    fn test_usb_without_interface() {
        let res: VisaResource = "USB0::0x0957::0x2707::MY62004362::INSTR".parse().unwrap();
        match res {
            VisaResource::Usb { product_id, interface, .. } => {
                assert_eq!(product_id, 0x2707);
                assert_eq!(interface, None);
            }
            other => panic!("unexpected resource: {other:?}"),
        }
    }

    #[test]
    fn test_socket_resource() {
        let res: VisaResource = "TCPIP0::192.168.1.20::5025::SOCKET".parse().unwrap();
        assert!(res.is_raw_socket());
        assert_eq!(
            res,
            VisaResource::TcpipSocket {
                board: 0,
                host: "192.168.1.20".to_string(),
                port: 5025
            }
        );
    }

    #[test]
    fn test_tcpip_instr_default_device() {
        let res: VisaResource = "TCPIP::scope.lab::INSTR".parse().unwrap();
        assert_eq!(res.to_string(), "TCPIP0::scope.lab::inst0::INSTR");
        assert!(!res.is_raw_socket());
    }

    #[test]
    fn test_gpib_and_serial() {
        let gpib: VisaResource = "GPIB0::7::INSTR".parse().unwrap();
        assert_eq!(gpib, VisaResource::Gpib { board: 0, address: 7 });

        let serial: VisaResource = "ASRL3::INSTR".parse().unwrap();
        assert_eq!(serial, VisaResource::Serial { port: "3".to_string() });
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("".parse::<VisaResource>().is_err());
        assert!("USB0::0xZZZZ::0x1002::SN::INSTR".parse::<VisaResource>().is_err());
        assert!("TCPIP0::host::notaport::SOCKET".parse::<VisaResource>().is_err());
        assert!("PXI0::1::INSTR".parse::<VisaResource>().is_err());
    }
}
