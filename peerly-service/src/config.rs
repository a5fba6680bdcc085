use peerly_proto::{throttler::MessageThrottler, wire::MAX_PACKET_SIZE};
use props_util::Properties;
use std::time::Duration;

#[derive(Properties, Debug, Clone)]
#[allow(unused)]
pub struct RelayConfig {
    // OS receive buffer applied right after bind
    #[prop(key = "recv_buffer_size", default = "65536")]
    pub recv_buffer_size: usize,
    #[prop(key = "send_buffer_size", default = "65536")]
    pub send_buffer_size: usize,
    // UDP datagrams cannot be bigger than 64k
    #[prop(key = "read_buffer_size", default = "65536")]
    pub read_buffer_size: usize,
    #[prop(key = "max_packet_size", default = "32768")]
    pub max_packet_size: usize,
    // STUN bytes allowed towards unverified peers per `ice_period_ms`
    #[prop(key = "ice_bandwidth", default = "32768")]
    pub ice_bandwidth: usize,
    #[prop(key = "ice_period_ms", default = "1000")]
    pub ice_period_ms: u64,
}

impl RelayConfig {
    pub fn throttler(&self) -> MessageThrottler {
        MessageThrottler::new(self.ice_bandwidth, Duration::from_millis(self.ice_period_ms))
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size.min(MAX_PACKET_SIZE)
    }
}
