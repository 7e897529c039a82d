use crate::backend::{Capabilities, ModeCtx, ModeId, Personality};
use crate::session::ProtoState;
use crate::token::Token;
use crate::BusError;

/// Every pin released; current before any mode is selected.
pub struct HiZ;

impl Personality for HiZ {
    fn id(&self) -> ModeId {
        ModeId::HiZ
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, _args: &[Token]) -> Result<usize, BusError> {
        ctx.proto.valid = true;
        Ok(0)
    }

    fn prompt(&self, _proto: &ProtoState) -> String {
        "> ".to_string()
    }
}
