//! Print the merged multi-version CRD as YAML, for chart packaging and
//! cluster bootstrap.

fn main() -> anyhow::Result<()> {
    let crd = controller::crds::merged_crd()?;
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
