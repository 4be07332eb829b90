//! Host side of the math worker demo.
//!
//! Run: cargo run --example call_worker
//! Needs `python` with the `websockets` package (override with PYBRIDGE_PYTHON).

use pybridge::{call, Bridge, BridgeError, BridgeOptions};

fn main() -> Result<(), BridgeError> {
    let bridge = Bridge::setup(None, BridgeOptions::from_env())?;
    println!("Logging to {}", bridge.log_file().display());

    let worker = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/math_worker.py");
    let module = bridge.load(worker)?;
    module.start(None)?;

    println!("Functions: {:?}\n", module.functions());

    let sum = call!(module, add(10, 20))?;
    println!("add(10, 20) = {}", sum);

    let product: i64 = module.call_as("multiply", vec![7.into(), 8.into()])?;
    println!("multiply(7, 8) = {}", product);

    let greeting = module.call_with("echo", ("hello from rust",))?;
    println!("echo(...) = {}", greeting);

    let fib = module.function("fibonacci")?;
    let value: u64 = fib.invoke_as(vec![10.into()])?;
    println!("fibonacci(10) = {}", value);

    match module.call("missing", vec![]) {
        Err(err) => println!("missing() -> {}", err),
        Ok(v) => println!("missing() unexpectedly returned {}", v),
    }

    println!("\n{:#?}", module.metrics());
    module.stop();
    Ok(())
}
