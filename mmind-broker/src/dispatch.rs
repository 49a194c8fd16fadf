use std::collections::HashMap;
use thiserror::Error;

use crate::{opcode::Opcode, transport::InboundMessage, ModelKey};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Opcode {opcode} already registered to {existing:?}")]
    Duplicate { opcode: Opcode, existing: ModelKey },
}

/// Which side of a model handles an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Response or unsolicited publish, handled by a client model
    ClientResponse,
    /// Request, handled by a server model
    ServerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub model: ModelKey,
    pub kind: HandlerKind,
}

/// Inbound frame paired with its route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Response { model: ModelKey, msg: InboundMessage },
    Request { model: ModelKey, msg: InboundMessage },
}

/// Maps opcodes to the local model handling them. Vendor opcodes are
/// namespaced by company id so models can share one table as long as
/// each opcode is registered once.
#[derive(Debug, Default)]
pub struct DispatchTable {
    routes: HashMap<Opcode, Route>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, opcode: Opcode, route: Route) -> Result<(), DispatchError> {
        if let Some(existing) = self.routes.get(&opcode) {
            log::error!("Opcode {opcode} already registered to {:?}", existing.model);
            return Err(DispatchError::Duplicate {
                opcode,
                existing: existing.model,
            });
        }
        log::debug!("Registered {opcode} -> {:?} {:?}", route.model, route.kind);
        self.routes.insert(opcode, route);
        Ok(())
    }

    pub fn register_model(
        &mut self,
        model: ModelKey,
        kind: HandlerKind,
        opcodes: &[Opcode],
    ) -> Result<(), DispatchError> {
        opcodes
            .iter()
            .try_for_each(|&op| self.register(op, Route { model, kind }))
    }

    pub fn lookup(&self, opcode: Opcode) -> Option<&Route> {
        self.routes.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Unknown opcodes are logged and dropped
    pub fn dispatch(&self, msg: InboundMessage) -> Option<Dispatched> {
        let Some(route) = self.routes.get(&msg.opcode) else {
            log::warn!(
                "Dropping unknown opcode {} from 0x{:04x} ({} octets)",
                msg.opcode,
                msg.src,
                msg.payload.len()
            );
            return None;
        };
        log::trace!(
            "Dispatching {} from 0x{:04x} to {:?}",
            msg.opcode,
            msg.src,
            route.model
        );
        Some(match route.kind {
            HandlerKind::ClientResponse => Dispatched::Response {
                model: route.model,
                msg,
            },
            HandlerKind::ServerRequest => Dispatched::Request {
                model: route.model,
                msg,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::CID_ESP, opcode::VendorOp};

    fn msg(opcode: Opcode, payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            src: 0x0005,
            dst: 0x0001,
            opcode,
            payload,
        }
    }

    #[test]
    fn routes_by_exact_opcode() {
        let client = ModelKey::vendor(CID_ESP, ModelKey::VND_CLIENT_ID);
        let server = ModelKey::vendor(CID_ESP, ModelKey::VND_SERVER_ID);
        let mut table = DispatchTable::new();
        table
            .register_model(
                client,
                HandlerKind::ClientResponse,
                &[VendorOp::Status.opcode(CID_ESP), VendorOp::DhtData.opcode(CID_ESP)],
            )
            .unwrap();
        table
            .register_model(server, HandlerKind::ServerRequest, &[VendorOp::Send.opcode(CID_ESP)])
            .unwrap();

        // payload passed through untouched, even when too short for its type
        let out = table.dispatch(msg(VendorOp::DhtData.opcode(CID_ESP), vec![1]));
        assert_eq!(
            out,
            Some(Dispatched::Response {
                model: client,
                msg: msg(VendorOp::DhtData.opcode(CID_ESP), vec![1])
            })
        );
        assert!(matches!(
            table.dispatch(msg(VendorOp::Send.opcode(CID_ESP), vec![7, 0])),
            Some(Dispatched::Request { model, .. }) if model == server
        ));
    }

    #[test]
    fn unknown_opcode_dropped() {
        let table = DispatchTable::new();
        assert_eq!(table.dispatch(msg(Opcode::Sig1(0x40), vec![])), None);
        // same op under a different company is a different opcode
        let mut table = DispatchTable::new();
        table
            .register(
                VendorOp::Send.opcode(CID_ESP),
                Route {
                    model: ModelKey::vendor(CID_ESP, 1),
                    kind: HandlerKind::ServerRequest,
                },
            )
            .unwrap();
        assert_eq!(table.dispatch(msg(VendorOp::Send.opcode(0x02E6), vec![])), None);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut table = DispatchTable::new();
        let route = Route {
            model: ModelKey::SENSOR_SERVER,
            kind: HandlerKind::ServerRequest,
        };
        table.register(crate::sig::SENSOR_GET, route).unwrap();
        assert!(matches!(
            table.register(crate::sig::SENSOR_GET, route),
            Err(DispatchError::Duplicate { .. })
        ));
        assert_eq!(table.len(), 1);
    }
}
