//! `merlin tools` — List the tools the planner can use.

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let registry = merlin_tools::default_registry();

    println!("Available tools");
    println!("===============");
    for schema in registry.schemas() {
        println!();
        println!("  {}", schema.kind);
        println!("    {}", schema.description);
        for param in &schema.params {
            let required = if param.required { "required" } else { "optional" };
            let default = param
                .default
                .as_ref()
                .map(|d| format!(", default {d}"))
                .unwrap_or_default();
            println!(
                "    - {} ({}, {required}{default}): {}",
                param.name,
                param.ty.label(),
                param.description
            );
        }
    }
    println!();
    println!("  A parameter may use an earlier step's result as \"{{{{step.N}}}}\" or \"{{{{step.N.field}}}}\".");

    Ok(())
}
