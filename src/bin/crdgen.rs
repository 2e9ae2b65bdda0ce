use anck::crd::{Network, Participants};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Network::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Participants::crd())?);
    Ok(())
}
