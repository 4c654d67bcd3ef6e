use std::sync::Arc;

use crate::error::{RemoteException, RemotingError, Result};
use crate::value::Value;

/// Which kind of outgoing call is being intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Static,
    Method,
    GetProperty,
    SetProperty,
    AddEvent,
    RemoveEvent,
    InvokeDelegate,
}

/// Description of an outgoing call handed to interceptors.
#[derive(Debug)]
pub struct CallInfo<'a> {
    pub kind: CallKind,
    /// Target object id, when the call addresses a proxy.
    pub target: Option<i64>,
    /// `Interface.member`, a type name or a static method name.
    pub member: &'a str,
    pub args: &'a [Value],
}

/// Decision returned from [`CallInterceptor::before`].
#[derive(Debug)]
pub enum Interception {
    Proceed,
    /// Skip the remote call and return this value.
    Return(Value),
    /// Skip the remote call and fail with this exception.
    Fail(RemoteException),
}

/// Hooks run around every outgoing call of an endpoint.
///
/// `before` runs after the proxy has been rebound and before the
/// instruction is sent; the first interceptor that does not proceed
/// short-circuits the call. `after` sees the outcome, including
/// short-circuited ones.
pub trait CallInterceptor: Send + Sync + 'static {
    fn before(&self, _call: &CallInfo<'_>) -> Interception {
        Interception::Proceed
    }

    fn after(&self, _call: &CallInfo<'_>, _outcome: &Result<Value>) {}
}

/// Run `call` wrapped in the interceptors' hooks.
pub(crate) fn intercept<F, T>(
    interceptors: &[Arc<dyn CallInterceptor>],
    info: &CallInfo<'_>,
    call: F,
) -> Result<(Value, T)>
where
    F: FnOnce() -> Result<(Value, T)>,
    T: Default,
{
    let mut short_circuit = None;
    for interceptor in interceptors {
        match interceptor.before(info) {
            Interception::Proceed => {}
            Interception::Return(value) => {
                short_circuit = Some(Ok(value));
                break;
            }
            Interception::Fail(exception) => {
                short_circuit = Some(Err(RemotingError::Remote(exception)));
                break;
            }
        }
    }

    let (outcome, extra) = match short_circuit {
        Some(outcome) => (outcome, T::default()),
        None => match call() {
            Ok((value, extra)) => (Ok(value), extra),
            Err(err) => (Err(err), T::default()),
        },
    };

    for interceptor in interceptors {
        interceptor.after(info, &outcome);
    }
    outcome.map(|value| (value, extra))
}
