//! Session tier: registration stores, push pipeline, registry facade.

mod fire;
mod push;
mod registry;
mod responder;
mod store;

pub use fire::FirePushService;
pub use push::{PushError, PushProcessor, PushSwitch, TaskKey};
pub use registry::SessionRegistry;
pub use responder::SessionSyncResponder;
pub use store::{RegistrationStore, SessionDataStore, SessionInterests, SessionWatchers};
