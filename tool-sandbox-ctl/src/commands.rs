use log::info;
use std::path::Path;
use tool_sandbox::{StaticRegistry, SystemCapabilities, ToolClass, ToolRegistry, utils};

pub fn check_requirements() {
    info!("Checking sandbox requirements");
    println!("Checking sandbox requirements...\n");

    let caps = SystemCapabilities::detect();
    println!("{}", caps.summary());

    if caps.can_sandbox() {
        println!("\nPlugin tools can be sandboxed on this host");
    } else {
        println!("\nPlugin tools will fail setup: user namespaces and seccomp are required");
    }

    println!("\nSystem info:");
    println!("  UID: {}", utils::get_uid());
    println!("  GID: {}", utils::get_gid());
}

pub fn list_tools(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Listing tools in {}", dir.display());
    let registry = StaticRegistry::from_dir(dir)?;
    let ids = registry.tool_ids();

    if ids.is_empty() {
        println!("No tools registered in {}", dir.display());
        return Ok(());
    }

    println!("Registered tools:\n");
    for id in ids {
        let Some(manifest) = registry.lookup(id) else {
            continue;
        };
        let class = match manifest.class {
            ToolClass::Plugin => "plugin",
            ToolClass::Display => "display",
        };
        let caps: Vec<&str> = manifest
            .required_capabilities
            .iter()
            .map(|c| c.as_str())
            .collect();
        println!("  {:20} {:8} tier={}", id, class, manifest.trust_tier);
        if !caps.is_empty() {
            println!("  {:20} requires {}", "", caps.join(", "));
        }
        if !manifest.grants.is_empty() {
            println!("  {:20} {} elevated grant(s)", "", manifest.grants.len());
        }
    }
    Ok(())
}
