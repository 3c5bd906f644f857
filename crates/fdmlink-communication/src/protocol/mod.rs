//! Wire protocol: outgoing line framing and incoming response parsing

pub mod framing;
pub mod response_parser;

pub use framing::{
    checksum, layer_marker, prepare_command, prepare_line, FramedLine, KEEPALIVE_COMMAND,
    LINE_NUMBER_RESET,
};
pub use response_parser::{
    parse_endstops, parse_temperatures, DeviceResponse, ResponseParser, TemperatureReport,
    FATAL_ERROR_MARKERS,
};
