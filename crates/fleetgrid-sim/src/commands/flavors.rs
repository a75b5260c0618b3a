use std::path::Path;

use fleet_core::{FlavorCatalog, FleetConfig};

pub fn list(path: &str, format: &str) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(Path::new(path))?;
    let catalog = config.flavor_catalog()?;

    match format {
        "json" => {
            let flavors: Vec<_> = catalog.iter().collect();
            println!("{}", serde_json::to_string_pretty(&flavors)?);
        }
        _ => {
            print!("{}", format_catalog(&catalog));
        }
    }

    Ok(())
}

/// One line per flavor, with the flavor new nodes actually get.
pub fn format_catalog(catalog: &FlavorCatalog) -> String {
    let mut out = String::new();
    for flavor in catalog.iter() {
        let effective = catalog.effective_flavor(flavor);
        let mut notes = Vec::new();
        if flavor.retired {
            notes.push("retired".to_string());
        }
        if effective.name != flavor.name {
            notes.push(format!("served as {}", effective.name));
        }
        if flavor.headroom > 0 {
            notes.push(format!("headroom {}", flavor.headroom));
        }
        out.push_str(&format!(
            "{:<14} {:<18} {}",
            flavor.name,
            flavor.kind.to_string(),
            flavor.resources
        ));
        if !notes.is_empty() {
            out.push_str(&format!("  ({})", notes.join(", ")));
        }
        out.push('\n');
    }
    out
}
