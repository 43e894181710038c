use anyhow::{bail, Result};
use rusqlite::Connection;
use std::env;
use std::path::Path;

use vehicle_identity::{
    execute_rehydration, import_vehicles, load_vehicles_csv, plan_rehydration, setup_database,
    upsert_vehicle, validate_vin, CandidateMatcher, MatchType, MergeExecutor, MergeGuard,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&args[2..]),
        Some("validate-vin") => run_validate_vin(&args[2..]),
        Some("find-duplicates") => run_find_duplicates(&args[2..]),
        Some("auto-merge") => run_auto_merge(&args[2..]),
        Some("rehydrate") => run_rehydrate(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("🚗 Vehicle Identity Resolution Engine v{}", vehicle_identity::VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Usage:");
    println!("  vehicle-identity import <vehicles.csv>");
    println!("  vehicle-identity validate-vin <vin>");
    println!("  vehicle-identity find-duplicates <vehicle-id>");
    println!("  vehicle-identity auto-merge <survivor-id> <absorbed-id> <actor-id> [match-type] [confidence]");
    println!("  vehicle-identity rehydrate <survivor-id> <merge-event-id> <actor-id> [--execute]");
    println!();
    println!("Database path comes from VEHICLE_DB (default: vehicles.db)");
}

fn open_database() -> Result<Connection> {
    let db_path = env::var("VEHICLE_DB").unwrap_or_else(|_| "vehicles.db".to_string());
    let conn = Connection::open(Path::new(&db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_import(args: &[String]) -> Result<()> {
    let csv_path = match args.first() {
        Some(p) => Path::new(p),
        None => bail!("usage: vehicle-identity import <vehicles.csv>"),
    };

    println!("🗄️  Vehicle Import - CSV → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading CSV...");
    let vehicles = load_vehicles_csv(csv_path)?;
    println!("✓ Loaded {} vehicles from CSV", vehicles.len());

    let mut conn = open_database()?;

    println!("\n💾 Inserting vehicles...");
    let (inserted, skipped) = import_vehicles(&conn, &vehicles)?;
    println!("✓ Inserted: {} vehicles", inserted);
    println!("✓ Skipped duplicates: {}", skipped);

    // Fire the merge hook for every row, exactly as the write path would
    println!("\n🔀 Checking for duplicates...");
    let executor = MergeExecutor::new();
    let guard = MergeGuard::new();
    let mut merges = 0;

    for vehicle in &vehicles {
        let event = upsert_vehicle(&conn, vehicle)?;
        let outcomes = executor.handle_upsert(&mut conn, &event, &guard)?;
        for outcome in outcomes {
            println!(
                "  ✓ Merged {} into {} ({}, confidence {:.0})",
                outcome.absorbed_id, outcome.survivor_id,
                outcome.match_type.as_str(), outcome.confidence,
            );
            merges += 1;
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Import complete: {} inserted, {} skipped, {} auto-merged", inserted, skipped, merges);

    Ok(())
}

fn run_validate_vin(args: &[String]) -> Result<()> {
    let vin = match args.first() {
        Some(v) => v,
        None => bail!("usage: vehicle-identity validate-vin <vin>"),
    };

    let result = validate_vin(vin);
    if result.valid {
        println!("✅ VALID ({}): {}", result.method.as_str(), result.reason);
    } else {
        println!("❌ INVALID ({}): {}", result.method.as_str(), result.reason);
    }

    Ok(())
}

fn run_find_duplicates(args: &[String]) -> Result<()> {
    let vehicle_id = match args.first() {
        Some(id) => id,
        None => bail!("usage: vehicle-identity find-duplicates <vehicle-id>"),
    };

    let conn = open_database()?;
    let matches = CandidateMatcher::new().find_duplicates_by_id(&conn, vehicle_id)?;

    if matches.is_empty() {
        println!("✓ No duplicate candidates for {}", vehicle_id);
        return Ok(());
    }

    println!("🔍 {} duplicate candidate(s) for {}:", matches.len(), vehicle_id);
    for m in matches {
        println!(
            "  {} | {} | confidence {:.0} | {}",
            m.candidate_id, m.match_type.as_str(), m.confidence, m.reasoning,
        );
    }

    Ok(())
}

fn run_auto_merge(args: &[String]) -> Result<()> {
    let (survivor_id, absorbed_id, actor_id) = match (args.first(), args.get(1), args.get(2)) {
        (Some(s), Some(a), Some(actor)) => (s, a, actor),
        _ => bail!("usage: vehicle-identity auto-merge <survivor-id> <absorbed-id> <actor-id>"),
    };

    // Operator consolidations default to the weakest match type unless stated
    let match_type = args
        .get(3)
        .and_then(|s| MatchType::parse(s))
        .unwrap_or(MatchType::YearMakeModel);
    let confidence = args
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| match_type.base_confidence());

    let mut conn = open_database()?;
    let merged = MergeExecutor::new().auto_merge(
        &mut conn,
        survivor_id,
        absorbed_id,
        match_type,
        confidence,
        actor_id,
    )?;

    if merged {
        println!("✅ Merged {} into {}", absorbed_id, survivor_id);
    } else {
        println!("✓ Nothing to merge: {} no longer exists", absorbed_id);
    }

    Ok(())
}

fn run_rehydrate(args: &[String]) -> Result<()> {
    let (survivor_id, merge_event_id, actor_id) = match (args.first(), args.get(1), args.get(2)) {
        (Some(s), Some(e), Some(a)) => (s, e, a),
        _ => bail!(
            "usage: vehicle-identity rehydrate <survivor-id> <merge-event-id> <actor-id> [--execute]"
        ),
    };
    let execute = args.iter().any(|a| a == "--execute");

    let mut conn = open_database()?;

    if execute {
        let result = execute_rehydration(&mut conn, survivor_id, merge_event_id, actor_id)?;
        println!("✅ Rehydrated: created vehicle {}", result.new_vehicle_id);
        println!("✓ Moved {} dependent record(s)", result.moved);
    } else {
        let plan = plan_rehydration(&conn, survivor_id, merge_event_id, actor_id)?;
        println!("💧 {} (dry run)", plan.summary());
        for planned in &plan.moves {
            println!("  {} | {} | {}", planned.record_id, planned.kind.as_str(), planned.reason);
        }
        if plan.is_empty() {
            println!("  (no provably-foreign records)");
        } else {
            println!("\nRe-run with --execute to apply.");
        }
    }

    Ok(())
}
