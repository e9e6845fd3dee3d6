use kube::CustomResourceExt;
use vpa_operator::crd::VpaManager;

fn main() {
    print!("{}", serde_yaml::to_string(&VpaManager::crd()).unwrap());
}
