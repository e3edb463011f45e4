use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&hcc_fleet::crd::MachineFleet::crd()).unwrap());
}
