//! Example: plan an owner change and print its encoding
//!
//! This example shows how to:
//! 1. Initialize tracing
//! 2. Plan the operations that turn one owner set into another
//! 3. Encode the plan as an account transaction
//!
//! Run with: `cargo run --example plan_owner_change`

use safe_lifecycle::{planner, telemetry, Address, EncodedTransaction, OwnerSet};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing("info")?;

    info!("Starting owner change planning example");

    let account: Address = "0x5afe000000000000000000000000000000000001".parse()?;
    let alice: Address = "0x00000000000000000000000000000000000a11ce".parse()?;
    let bob: Address = "0x0000000000000000000000000000000000000b0b".parse()?;
    let carol: Address = "0x00000000000000000000000000000000000ca201".parse()?;
    let dave: Address = "0x000000000000000000000000000000000000da7e".parse()?;

    let current = OwnerSet::new(vec![alice.clone(), bob, carol.clone()], 2);
    let target = OwnerSet::new(vec![alice, dave, carol], 3);

    let operations = planner::plan(&current, &target)?;
    println!("Planned {} operation(s):", operations.len());
    for (i, operation) in operations.iter().enumerate() {
        println!("  {}. {} {:?}", i + 1, operation.method(), operation);
    }

    let transaction = EncodedTransaction::owner_mutation(&account, 42, operations)?;
    println!("\nEncoded transaction:");
    println!("{}", serde_json::to_string_pretty(&transaction)?);

    info!("Example completed successfully");
    Ok(())
}
