use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use objmux_channel::Disposition;

use crate::error::{RemoteException, RemotingError, Result};
use crate::object::{CallContext, RemoteObject};
use crate::user_channel::UserChannel;
use crate::value::Value;

/// What user code returns to the peer: a built object or a value.
pub type ObjectResult = std::result::Result<Arc<dyn RemoteObject>, RemoteException>;
pub type ValueResult = std::result::Result<Value, RemoteException>;

/// Builds an object for `CreateObject`.
pub type ObjectFactory = Arc<dyn Fn(&CallContext, &mut [Value]) -> ObjectResult + Send + Sync>;

/// Handles `InvokeStaticMethod`.
pub type StaticMethod = Arc<dyn Fn(&CallContext, &mut [Value]) -> ValueResult + Send + Sync>;

/// Rebuilds an object from recreate data for `Recreate`.
pub type RecreateFactory = Arc<dyn Fn(&CallContext, Value) -> ObjectResult + Send + Sync>;

/// Receives user channels opened by the peer.
pub type UserChannelHandler = Arc<dyn Fn(UserChannel) -> Disposition + Send + Sync>;

#[derive(Default)]
struct Entries {
    types: HashMap<String, ObjectFactory>,
    statics: HashMap<String, StaticMethod>,
    recreatables: HashMap<String, RecreateFactory>,
    user_channels: Option<UserChannelHandler>,
}

/// Types, static methods and handlers an endpoint exposes to its peers.
///
/// Registration is only allowed from the thread that created the endpoint
/// and only until it starts; after that the registry is read-only.
pub struct Registry {
    owner: ThreadId,
    sealed: AtomicBool,
    entries: RwLock<Entries>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            owner: thread::current().id(),
            sealed: AtomicBool::new(false),
            entries: RwLock::new(Entries::default()),
        }
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(RemotingError::RegistrationClosed("endpoint already started"));
        }
        if thread::current().id() != self.owner {
            return Err(RemotingError::RegistrationClosed(
                "registrations must come from the thread that created the endpoint",
            ));
        }
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Entries>> {
        self.check_open()?;
        Ok(self.entries.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register_type(&self, name: &str, factory: ObjectFactory) -> Result<()> {
        self.write()?.types.insert(name.to_string(), factory);
        Ok(())
    }

    pub(crate) fn register_static_method(&self, name: &str, method: StaticMethod) -> Result<()> {
        self.write()?.statics.insert(name.to_string(), method);
        Ok(())
    }

    pub(crate) fn register_recreatable(&self, name: &str, factory: RecreateFactory) -> Result<()> {
        self.write()?.recreatables.insert(name.to_string(), factory);
        Ok(())
    }

    pub(crate) fn set_user_channel_handler(&self, handler: UserChannelHandler) -> Result<()> {
        self.write()?.user_channels = Some(handler);
        Ok(())
    }

    pub(crate) fn factory(&self, name: &str) -> Option<ObjectFactory> {
        self.read().types.get(name).cloned()
    }

    pub(crate) fn static_method(&self, name: &str) -> Option<StaticMethod> {
        self.read().statics.get(name).cloned()
    }

    pub(crate) fn recreatable(&self, name: &str) -> Option<RecreateFactory> {
        self.read().recreatables.get(name).cloned()
    }

    pub(crate) fn user_channel_handler(&self) -> Option<UserChannelHandler> {
        self.read().user_channels.clone()
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered static method names, sorted.
    pub fn static_method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().statics.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sealed", &self.is_sealed())
            .field("types", &self.type_names())
            .field("statics", &self.static_method_names())
            .finish()
    }
}

/// Registration surface shared by clients and servers.
pub trait Registrar {
    #[doc(hidden)]
    fn registry(&self) -> &Registry;

    /// Make `name` constructible by the peer with `CreateObject`.
    fn register_type<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&CallContext, &mut [Value]) -> ObjectResult + Send + Sync + 'static,
    {
        self.registry().register_type(name, Arc::new(factory))
    }

    fn register_static_method<F>(&self, name: &str, method: F) -> Result<()>
    where
        F: Fn(&CallContext, &mut [Value]) -> ValueResult + Send + Sync + 'static,
    {
        self.registry().register_static_method(name, Arc::new(method))
    }

    /// Back the `Recreate` instruction for objects lent with recreate data
    /// of this type.
    fn register_recreatable<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&CallContext, Value) -> ObjectResult + Send + Sync + 'static,
    {
        self.registry().register_recreatable(name, Arc::new(factory))
    }

    fn on_user_channel<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(UserChannel) -> Disposition + Send + Sync + 'static,
    {
        self.registry().set_user_channel_handler(Arc::new(handler))
    }
}
