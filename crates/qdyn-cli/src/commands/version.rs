//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - differentiable quantum dynamics",
        style("qdyn").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Equations:");
    println!("  schrodinger        dψ/dt = −iHψ");
    println!("  lindblad           dρ/dt = −i[H, ρ] + Σ D[L]ρ");
    println!("  stochastic_master  diffusive unraveling with measurement record");
    println!();
    println!("Methods:");
    println!("  dopri5, tsit5      adaptive, differentiable");
    println!("  dopri8             adaptive, high order, differentiable");
    println!("  euler              fixed step, differentiable");
    println!("  rouchon1           fixed step, trace preserving");
    println!("  propagator         exact, constant operators, differentiable");
    println!("  euler_maruyama     fixed step, stochastic");
    println!();
    println!("License:    {}", style("Apache-2.0").dim());
}
