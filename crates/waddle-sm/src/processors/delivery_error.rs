//! Internal delivery-error marker.
//!
//! When the transport cannot hand a stanza to a client connection it sends
//! the stanza back to the session manager wrapped by
//! [`make_delivery_error`], stamped with the time the target connection was
//! known to be gone. The marker is for the server only; the filter removes
//! it from everything leaving the pipeline.

use std::sync::Arc;

use minidom::Element;
use tracing::trace;

use crate::error::SmError;
use crate::packet::{ns, Packet, Results};
use crate::processor::{PacketFilter, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::ResourceConnection;
use crate::settings::Settings;

pub const ID: &str = "delivery-error";

const ELEM_NAME: &str = "delivery-error";

/// Copy of `packet` carrying the delivery-error marker.
///
/// Addresses are kept so the stanza can be redelivered to another resource
/// or stored offline.
pub fn make_delivery_error(packet: &Packet, stamp: Option<i64>) -> Result<Packet, SmError> {
    let mut marker = Element::builder(ELEM_NAME, ns::DELIVERY_ERROR);
    if let Some(stamp) = stamp {
        marker = marker.attr("stamp", stamp.to_string());
    }

    let mut element = packet.element().clone();
    strip(&mut element);
    element.append_child(marker.build());

    let mut copy = Packet::new(element)?.with_priority(packet.priority());
    copy.set_packet_from(packet.packet_from().cloned());
    copy.set_packet_to(packet.packet_to().cloned());
    Ok(copy)
}

/// The marker element, if present.
pub fn delivery_error(packet: &Packet) -> Option<&Element> {
    packet.element().get_child(ELEM_NAME, ns::DELIVERY_ERROR)
}

/// Stamp of the marker in milliseconds since the epoch.
pub fn delivery_error_stamp(packet: &Packet) -> Option<i64> {
    delivery_error(packet)?.attr("stamp")?.parse().ok()
}

fn strip(element: &mut Element) -> bool {
    element.remove_child(ELEM_NAME, ns::DELIVERY_ERROR).is_some()
}

/// Removes delivery-error markers from outbound packets.
#[derive(Debug, Default)]
pub struct DeliveryErrorFilter;

impl PacketFilter for DeliveryErrorFilter {
    fn filter(
        &self,
        _packet: Option<&Packet>,
        _session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) {
        for packet in results.iter_mut() {
            if packet.was_processed_by(ID) {
                continue;
            }
            if strip(packet.element_mut()) {
                trace!(packet = %packet, "Stripped delivery-error marker");
            }
            packet.processed(ID);
        }
    }
}

pub fn descriptor() -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID).filter(Arc::new(DeliveryErrorFilter))
}
