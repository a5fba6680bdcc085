pub mod config;
pub mod datagram;
pub mod error;
pub mod events;
pub mod manager;
pub mod socket;

#[cfg(test)]
mod testing;

pub use peerly_proto::wire::*;

#[macro_export]
macro_rules! socket_counter {
    ($val:expr) => {
        let socket_counter = opentelemetry::global::meter("peerly-service")
            .i64_up_down_counter("p2p.active-sockets")
            .with_description("Open P2P Sockets")
            .build();

        socket_counter.add($val, &[opentelemetry::KeyValue::new("protocol", "udp")]);
    };
}
