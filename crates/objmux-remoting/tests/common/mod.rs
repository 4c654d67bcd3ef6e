#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use objmux_remoting::{
    CallContext, DelegateHandle, DelegateShape, EndpointConfig, EventHandlers, InterfaceShape,
    MemberRef, MethodShape, RecreateInfo, Registrar, RemoteException, RemoteObject,
    RemotingClient, RemotingServer, Value,
};
use objmux_transport::Address;

pub fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/objmux-rt-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

/// Poll `check` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, RemoteException> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            RemoteException::invalid_argument(format!("argument {index} must be an int"))
        })
}

/// Counts observed on the server side.
#[derive(Default)]
pub struct Stats {
    pub name_reads: AtomicUsize,
    pub counter_makes: AtomicUsize,
    pub recreates: AtomicUsize,
}

pub struct Calculator {
    name: String,
    precision: AtomicI64,
    computed: EventHandlers,
    stats: Arc<Stats>,
}

impl Calculator {
    pub fn new(name: &str, stats: Arc<Stats>) -> Self {
        Self {
            name: name.to_string(),
            precision: AtomicI64::new(2),
            computed: EventHandlers::new(),
            stats,
        }
    }
}

impl RemoteObject for Calculator {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("ICalculator")
            .method("add", &["a", "b"])
            .method_shape(
                MethodShape::new("divmod")
                    .param("a")
                    .param("b")
                    .out_param("quotient")
                    .out_param("remainder"),
            )
            .method("fail", &["message"])
            .method("subscribe", &["handler"])
            .method("make_counter", &["start"])
            .method("spawn", &["name"])
            .cached_property("name", false)
            .property("precision", true)
            .event("computed", DelegateShape::new("ComputedHandler").param("result"))]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        args: &mut [Value],
    ) -> Result<Value, RemoteException> {
        match member.member.as_str() {
            "add" => {
                let sum = int_arg(args, 0)? + int_arg(args, 1)?;
                self.computed.raise(&[Value::Int(sum)]);
                Ok(Value::Int(sum))
            }
            "divmod" => {
                let (a, b) = (int_arg(args, 0)?, int_arg(args, 1)?);
                if b == 0 {
                    return Err(RemoteException::invalid_argument("division by zero"));
                }
                if let Some(slot) = args.get_mut(2) {
                    *slot = Value::Int(a / b);
                }
                if let Some(slot) = args.get_mut(3) {
                    *slot = Value::Int(a % b);
                }
                Ok(Value::Null)
            }
            "fail" => Err(RemoteException::invocation(
                args.first().and_then(Value::as_str).unwrap_or("failed"),
            )),
            "subscribe" => {
                let handler = args
                    .first()
                    .and_then(Value::as_delegate)
                    .cloned()
                    .ok_or_else(|| {
                        RemoteException::invalid_argument("handler must be a delegate")
                    })?;
                self.computed.add(handler);
                Ok(Value::object(Subscription))
            }
            "spawn" => {
                let name = args.first().and_then(Value::as_str).unwrap_or("child");
                Ok(Value::object(Calculator::new(name, Arc::clone(&self.stats))))
            }
            "make_counter" => {
                self.stats.counter_makes.fetch_add(1, Ordering::SeqCst);
                Ok(Value::object(Counter::new(int_arg(args, 0)?)))
            }
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn get_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
    ) -> Result<Value, RemoteException> {
        match member.member.as_str() {
            "name" => {
                self.stats.name_reads.fetch_add(1, Ordering::SeqCst);
                Ok(Value::from(self.name.as_str()))
            }
            "precision" => Ok(Value::Int(self.precision.load(Ordering::SeqCst))),
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn set_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        value: Value,
    ) -> Result<(), RemoteException> {
        match member.member.as_str() {
            "precision" => {
                let precision = value
                    .as_i64()
                    .ok_or_else(|| RemoteException::invalid_argument("precision must be an int"))?;
                self.precision.store(precision, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn add_event(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        handler: DelegateHandle,
    ) -> Result<(), RemoteException> {
        self.computed.add(handler);
        Ok(())
    }

    fn remove_event(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        handler: &DelegateHandle,
    ) -> Result<(), RemoteException> {
        self.computed.remove(handler);
        Ok(())
    }
}

/// Counter that can be rebuilt from its starting value.
pub struct Counter {
    start: i64,
    value: AtomicI64,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            value: AtomicI64::new(start),
        }
    }
}

impl RemoteObject for Counter {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("ICounter")
            .method("increment", &[])
            .property("value", false)]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        _args: &mut [Value],
    ) -> Result<Value, RemoteException> {
        match member.member.as_str() {
            "increment" => Ok(Value::Int(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn get_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
    ) -> Result<Value, RemoteException> {
        match member.member.as_str() {
            "value" => Ok(Value::Int(self.value.load(Ordering::SeqCst))),
            _ => Err(RemoteException::member_not_found(member)),
        }
    }

    fn recreate_info(&self) -> Option<RecreateInfo> {
        Some(RecreateInfo {
            type_name: "Counter".to_string(),
            data: Value::Int(self.start),
        })
    }
}

/// Token handed out by `subscribe`; has no way to be rebuilt.
pub struct Subscription;

impl RemoteObject for Subscription {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("ISubscription").method("active", &[])]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        _args: &mut [Value],
    ) -> Result<Value, RemoteException> {
        Ok(Value::Bool(true))
    }
}

/// Hosted by clients so the server can call back into them.
pub struct Greeter;

impl RemoteObject for Greeter {
    fn interfaces(&self) -> Vec<InterfaceShape> {
        vec![InterfaceShape::new("IGreeter").method("greet", &["name"])]
    }

    fn invoke(
        &self,
        _ctx: &CallContext,
        _member: &MemberRef,
        args: &mut [Value],
    ) -> Result<Value, RemoteException> {
        let name = args.first().and_then(Value::as_str).unwrap_or("stranger");
        Ok(Value::from(format!("hello, {name}")))
    }
}

pub struct Fixture {
    pub server: RemotingServer,
    pub address: Address,
    pub stats: Arc<Stats>,
    pub dir: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.dispose();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// A started server hosting the demo types.
pub fn start_server(tag: &str) -> Fixture {
    let dir = unique_temp_dir(tag);
    let address = Address::Unix(dir.join("remoting.sock"));
    let server =
        RemotingServer::bind(&address, EndpointConfig::default()).expect("server should bind");
    let stats = Arc::new(Stats::default());
    let shared = Arc::new(Calculator::new("shared", Arc::clone(&stats)));

    let calc_stats = Arc::clone(&stats);
    server
        .register_type("Calculator", move |_ctx, args| {
            let name = args.first().and_then(Value::as_str).unwrap_or("calc");
            Ok(Arc::new(Calculator::new(name, Arc::clone(&calc_stats))) as Arc<dyn RemoteObject>)
        })
        .expect("register Calculator");
    server
        .register_static_method("calc.shared", move |_ctx, _args| {
            Ok(Value::local(Arc::clone(&shared) as Arc<dyn RemoteObject>))
        })
        .expect("register calc.shared");
    let make_stats = Arc::clone(&stats);
    server
        .register_static_method("counter.make", move |_ctx, args| {
            make_stats.counter_makes.fetch_add(1, Ordering::SeqCst);
            Ok(Value::object(Counter::new(int_arg(args, 0)?)))
        })
        .expect("register counter.make");
    let recreate_stats = Arc::clone(&stats);
    server
        .register_recreatable("Counter", move |_ctx, data| {
            recreate_stats.recreates.fetch_add(1, Ordering::SeqCst);
            let start = data
                .as_i64()
                .ok_or_else(|| RemoteException::invalid_argument("counter data must be an int"))?;
            Ok(Arc::new(Counter::new(start)) as Arc<dyn RemoteObject>)
        })
        .expect("register Counter");
    server
        .register_static_method("math.square", |_ctx, args| {
            let x = int_arg(args, 0)?;
            Ok(Value::Int(x * x))
        })
        .expect("register math.square");
    server
        .register_static_method("slow.echo", |_ctx, args| {
            let millis = int_arg(args, 0)?;
            thread::sleep(Duration::from_millis(millis.max(0) as u64));
            Ok(args.get(1).cloned().unwrap_or_default())
        })
        .expect("register slow.echo");
    server
        .register_static_method("session.id", |ctx, _args| {
            Ok(Value::Int(ctx.session().id() as i64))
        })
        .expect("register session.id");
    server.start().expect("server should start");

    Fixture {
        server,
        address,
        stats,
        dir,
    }
}

pub fn client_config(reconnect: bool) -> EndpointConfig {
    EndpointConfig {
        call_timeout: Some(Duration::from_secs(10)),
        connect_timeout: Duration::from_secs(2),
        ..EndpointConfig::default()
    }
    .with_reconnect(reconnect)
}

pub fn started_client(address: &Address, reconnect: bool) -> RemotingClient {
    let client = RemotingClient::new(address.clone(), client_config(reconnect));
    client.start().expect("client should start");
    client
}

/// Collects values delivered to a local event handler.
#[derive(Clone, Default)]
pub struct Received(pub Arc<Mutex<Vec<Value>>>);

impl Received {
    pub fn handler(&self) -> Value {
        let sink = Arc::clone(&self.0);
        Value::delegate(objmux_remoting::LocalDelegate::new(
            DelegateShape::new("ComputedHandler").param("result"),
            move |args| {
                sink.lock()
                    .expect("sink lock")
                    .push(args.first().cloned().unwrap_or_default());
                Ok(Value::Null)
            },
        ))
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.lock().expect("sink lock").clone()
    }
}
