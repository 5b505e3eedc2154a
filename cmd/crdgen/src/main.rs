use pixop_service_account::crd::PixoServiceAccount;

use kube::CustomResourceExt;

fn main() {
    for crd in [PixoServiceAccount::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
