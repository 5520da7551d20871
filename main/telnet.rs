//! Thin wrapper around `libtelnet_rs` for IAC option-negotiation
//! filtering (spec §4.D: "for telnet sources, filter through the IAC
//! state machine first").
//!
//! Grounded on `libtelnet_rs::Parser` usage in
//! `other_examples/.../telnet/src/server/mod.rs`: feed raw bytes to
//! `Parser::receive`, get back a stream of `TelnetEvents`, and re-emit
//! only the `DataReceive`/`DataSend` payloads as console bytes while the
//! parser answers option negotiation out of band via `DataSend`.

use libtelnet_rs::events::TelnetEvents;
use libtelnet_rs::telnet::op_option as options;
use libtelnet_rs::Parser;

/// Build a parser that supports the handful of options a dumb console
/// proxy cares about: binary transparency and suppress-go-ahead, so line
/// mode haggling with the remote device doesn't get mixed into the
/// concentrated byte stream.
pub fn new_parser() -> Parser {
    let mut parser = Parser::new();
    parser.options.support_local(options::BINARY);
    parser.options.support_remote(options::BINARY);
    parser.options.support_local(options::SGA);
    parser.options.support_remote(options::SGA);
    parser
}

/// Feed `raw` through the option-negotiation state machine. Returns the
/// plain data bytes to forward to writer peers, and any reply bytes the
/// parser wants written back to the telnet object's own output buffer
/// (negotiation acks run over the same fd they arrived on).
pub fn filter(parser: &mut Parser, raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::new();
    let mut replies = Vec::new();
    for event in parser.receive(raw) {
        match event {
            TelnetEvents::DataReceive(bytes) => data.extend(bytes),
            TelnetEvents::DataSend(bytes) => replies.extend(bytes),
            TelnetEvents::Negotiation(_) | TelnetEvents::Subnegotiation(_) => {}
            TelnetEvents::IAC(_) => {}
            TelnetEvents::DecompressImmediate(_) => {}
        }
    }
    (data, replies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes_pass_through_unfiltered() {
        let mut parser = new_parser();
        let (data, replies) = filter(&mut parser, b"hello\r\n");
        assert_eq!(data, b"hello\r\n");
        assert!(replies.is_empty());
    }

    #[test]
    fn iac_bytes_are_stripped_from_data_stream() {
        let mut parser = new_parser();
        // IAC WILL ECHO followed by plain data
        let input = [255u8, 251, 1, b'h', b'i'];
        let (data, _replies) = filter(&mut parser, &input);
        assert_eq!(data, b"hi");
    }
}
