#![no_main]

use libfuzzer_sys::fuzz_target;
use rustbac_datalink::bip::bvlc::BvlcFunction;
use rustbac_datalink::bip::service::{BbmdState, BvllMode, ForeignState};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::time::Instant;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let from = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 47808));
    let function = BvlcFunction::from_u8(data[1]);
    let payload = &data[2..];

    let mut mode = match data[0] % 3 {
        0 => BvllMode::Normal,
        1 => {
            let bbmd = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 47808));
            BvllMode::Foreign(ForeignState::new(bbmd, 60))
        }
        _ => {
            let self_addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 47808);
            BvllMode::Bbmd(BbmdState::new(self_addr, Vec::new()))
        }
    };

    let _ = mode.inbound(from, function, payload, Instant::now());
});
