/***************************************************************************************************
Dispatch of an `InboundMessage` to whichever component owns its reply.
A single tagged-union `match` over the four message kinds, in the same
style as an event-type `match` over a discrete-event queue: one dispatch
point, no reflective handler registry.

`RouteSink` exists so this module stays decoupled from the concrete
`Node` type that implements it.
***************************************************************************************************/

use crate::ids::NodeName;
use crate::messages::{ElectionMessage, InboundMessage, InstanceChange, Request, ThreePhaseMessage};

/// Implemented by whatever owns the Elector/Replica/Monitor triad — `Node`
/// in this crate — so `dispatch` never needs to know their concrete type.
pub trait RouteSink {
    fn on_client_request(&mut self, sender: NodeName, req: Request);
    fn on_election(&mut self, sender: NodeName, msg: ElectionMessage);
    fn on_three_phase(&mut self, sender: NodeName, msg: ThreePhaseMessage);
    fn on_instance_change(&mut self, sender: NodeName, msg: InstanceChange);
}

/// Route one inbound message to its owning component. Unknown/malformed
/// tags cannot reach this point: they are rejected as `CoreError::Malformed`
/// at the deserialization boundary, before a `Router` ever sees them.
pub fn dispatch(sink: &mut dyn RouteSink, sender: NodeName, msg: InboundMessage) {
    match msg {
        InboundMessage::ClientRequest(req) => sink.on_client_request(sender, req),
        InboundMessage::Election(em) => sink.on_election(sender, em),
        InboundMessage::ThreePhase(tpm) => sink.on_three_phase(sender, tpm),
        InboundMessage::InstanceChange(ic) => sink.on_instance_change(sender, ic),
    }
}
