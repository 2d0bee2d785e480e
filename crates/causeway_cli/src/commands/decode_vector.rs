//! Decode vector command implementation.

use causeway_sync_protocol::VersionVector;

/// Runs the decode-vector command.
pub fn run(encoded: &str, baseline: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let vector = decode(encoded, baseline)?;
    println!("{}", vector);
    for (replica, counter) in vector.iter() {
        println!("  {:20} {}", replica.as_str(), counter);
    }
    Ok(())
}

fn decode(encoded: &str, baseline: Option<&str>) -> Result<VersionVector, Box<dyn std::error::Error>> {
    let bytes = hex::decode(encoded.trim())?;
    let vector = match baseline {
        Some(base) => {
            let base = VersionVector::from_bytes(&hex::decode(base.trim())?)?;
            VersionVector::from_bytes_against(&bytes, &base)?
        }
        None => VersionVector::from_bytes(&bytes)?,
    };
    Ok(vector)
}
