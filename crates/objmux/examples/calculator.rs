//! Server and client in one process: the server hosts a `Calculator`, the
//! client creates one and subscribes to its results.
//!
//! Run with:
//!   cargo run --example calculator

use std::fs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use objmux::remoting::{
    CallContext, DelegateHandle, DelegateShape, EndpointConfig, EventHandlers, InterfaceShape,
    LocalDelegate, MemberRef, Registrar, RemoteException, RemoteObject, RemotingClient,
    RemotingServer, Value,
};
use objmux::transport::Address;

struct Calculator {
    total: AtomicI64,
    changed: EventHandlers,
}

impl RemoteObject for Calculator {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("ICalculator")
            .method("add", &["amount"])
            .property("total", false)
            .event("changed", DelegateShape::new("TotalChanged").param("total"))]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        args: &mut [Value],
    ) -> Result<Value, RemoteException> {
        if member.member != "add" {
            return Err(RemoteException::member_not_found(member));
        }
        let amount = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteException::invalid_argument("amount must be an int"))?;
        let total = self.total.fetch_add(amount, Ordering::SeqCst) + amount;
        self.changed.raise(&[Value::Int(total)]);
        Ok(Value::Int(total))
    }

    fn get_property(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
    ) -> Result<Value, RemoteException> {
        Ok(Value::Int(self.total.load(Ordering::SeqCst)))
    }

    fn add_event(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        handler: DelegateHandle,
    ) -> Result<(), RemoteException> {
        self.changed.add(handler);
        Ok(())
    }

    fn remove_event(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        handler: &DelegateHandle,
    ) -> Result<(), RemoteException> {
        self.changed.remove(handler);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("objmux-calc-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let address = Address::Unix(sock_dir.join("calc.sock"));

    let server = RemotingServer::bind(&address, EndpointConfig::default())?;
    server.register_type("Calculator", |_ctx, _args| {
        Ok(Arc::new(Calculator {
            total: AtomicI64::new(0),
            changed: EventHandlers::new(),
        }) as Arc<dyn RemoteObject>)
    })?;
    server.start()?;
    eprintln!("Listening on {address}");

    let client = RemotingClient::new(address, EndpointConfig::default());
    client.start()?;
    let calc = client.create("Calculator", vec![])?;

    let handler = LocalDelegate::new(DelegateShape::new("TotalChanged").param("total"), |args| {
        eprintln!("total changed: {}", args.first().cloned().unwrap_or_default());
        Ok(Value::Null)
    });
    calc.add_event("changed", DelegateHandle::Local(Arc::new(handler)))?;

    for amount in [5, 10, 27] {
        calc.call("add", vec![Value::from(amount)])?;
    }
    eprintln!("final total: {}", calc.get("total")?);

    client.dispose();
    server.dispose();
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
