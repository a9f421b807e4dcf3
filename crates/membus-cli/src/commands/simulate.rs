use membus_core::config::MAX_ID_BITS;
use membus_core::sim::simulate_discovery;
use membus_core::{PhaseResult, Role, assign_role};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SimulatedParticipant {
    id: u32,
    phases: Vec<u32>,
    advertised: bool,
    role: Option<Role>,
}

fn simulate(ids: &[u32], max_bits: u32, phases: u32, repeat: bool) -> Vec<SimulatedParticipant> {
    simulate_discovery(ids, max_bits, phases, repeat)
        .into_iter()
        .map(|p| {
            let result: &PhaseResult = p.phases();
            SimulatedParticipant {
                id: p.id(),
                phases: result.ids().to_vec(),
                advertised: p.advertised(),
                role: assign_role(result, p.id()).map(|a| a.role),
            }
        })
        .collect()
}

/// Reject an id space or ids the protocol cannot run with.
fn check_args(ids: &[u32], max_bits: u32) -> Result<(), String> {
    if max_bits == 0 || max_bits > MAX_ID_BITS {
        return Err(format!("max bits {max_bits} out of range [1, {MAX_ID_BITS}]"));
    }
    let limit = 1u64 << max_bits;
    match ids.iter().find(|&&id| id == 0 || u64::from(id) >= limit) {
        Some(bad) => Err(format!("id {bad} out of range [1, {limit})")),
        None => Ok(()),
    }
}

pub fn run(ids: &[u32], max_bits: u32, phases: u32, repeat: bool, json: bool) {
    if let Err(e) = check_args(ids, max_bits) {
        eprintln!("{e}");
        std::process::exit(2);
    }

    let result = simulate(ids, max_bits, phases, repeat);

    if json {
        if let Err(e) = super::emit_json(&result, None) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        return;
    }

    println!(
        "Simulated discovery: {} participants, {max_bits}-bit ids, {}",
        ids.len(),
        if repeat { "repeating" } else { "enumerating" }
    );
    println!();
    println!("  {:>6}  {:<10}  {:<8}  Phase ids", "Id", "Advertised", "Role");
    for p in &result {
        let role = match p.role {
            Some(Role::Sender) => "sender",
            Some(Role::Receiver) => "receiver",
            None => "-",
        };
        println!(
            "  {:>6}  {:<10}  {:<8}  {:?}",
            p.id, p.advertised, role, p.phases
        );
    }
}
