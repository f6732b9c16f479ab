//! Command catalog for Ubuntu 20.04+ hosts.
//!
//! Commands assume a sudo-capable login. Multi-line command text is sent
//! as-is; the remote shell runs each embedded line in sequence.

use super::{CommandStep, OutputParser};
use crate::utils::shell::quote_arg;

const KUBERNETES_APT_CHANNEL: &str = "v1.30";
const CRIO_APT_CHANNEL: &str = "v1.30";

pub struct UbuntuCommandLib;

impl UbuntuCommandLib {
    // Common bootstrap chain for control-plane and worker nodes

    pub fn apt_update(&self) -> CommandStep {
        CommandStep::required("sudo apt-get update")
    }

    pub fn apt_full_upgrade(&self) -> CommandStep {
        CommandStep::required("sudo apt-get -y full-upgrade")
    }

    pub fn install_prereqs(&self) -> CommandStep {
        CommandStep::required(
            "sudo apt-get install -y apt-transport-https ca-certificates curl gpg",
        )
    }

    pub fn add_crio_repo(&self) -> CommandStep {
        CommandStep::required(format!(
            "sudo mkdir -p /etc/apt/keyrings\n\
             curl -fsSL https://pkgs.k8s.io/addons:/cri-o:/stable:/{channel}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/cri-o-apt-keyring.gpg\n\
             echo \"deb [signed-by=/etc/apt/keyrings/cri-o-apt-keyring.gpg] https://pkgs.k8s.io/addons:/cri-o:/stable:/{channel}/deb/ /\" | sudo tee /etc/apt/sources.list.d/cri-o.list",
            channel = CRIO_APT_CHANNEL
        ))
    }

    pub fn install_crio(&self) -> CommandStep {
        CommandStep::required("sudo apt-get install -y cri-o")
    }

    pub fn enable_crio(&self) -> CommandStep {
        CommandStep::required(
            "sudo systemctl enable crio.service\nsudo systemctl start crio.service",
        )
    }

    pub fn disable_swap(&self) -> CommandStep {
        CommandStep::required("sudo swapoff -a")
    }

    pub fn add_kubernetes_repo(&self) -> CommandStep {
        CommandStep::required(format!(
            "sudo mkdir -p /etc/apt/keyrings\n\
             curl -fsSL https://pkgs.k8s.io/core:/stable:/{channel}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg\n\
             echo \"deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{channel}/deb/ /\" | sudo tee /etc/apt/sources.list.d/kubernetes.list",
            channel = KUBERNETES_APT_CHANNEL
        ))
    }

    pub fn install_kubeadm(&self) -> CommandStep {
        CommandStep::required(
            "sudo apt-get update\n\
             sudo apt-get install -y kubelet kubeadm kubectl\n\
             sudo apt-mark hold kubelet kubeadm kubectl",
        )
    }

    pub fn enable_bridge_netfilter(&self) -> CommandStep {
        CommandStep::required(
            "sudo modprobe br_netfilter\necho br_netfilter | sudo tee /etc/modules-load.d/k8s.conf",
        )
    }

    pub fn enable_ip_forward(&self) -> CommandStep {
        CommandStep::required("echo '1' | sudo tee /proc/sys/net/ipv4/ip_forward")
    }

    // Control-plane initialization

    pub fn init_kubeadm(&self, parser: OutputParser) -> CommandStep {
        CommandStep::required("sudo kubeadm init --pod-network-cidr=10.244.0.0/16")
            .with_parser(parser)
    }

    /// Kubeconfig placement for the login user. Best-effort: a stale
    /// ~/.kube from an earlier install must not abort the bootstrap.
    pub fn place_kubeconfig(&self) -> CommandStep {
        CommandStep::anyway(
            "rm -rf $HOME/.kube\n\
             mkdir -p $HOME/.kube\n\
             sudo cp -i /etc/kubernetes/admin.conf $HOME/.kube/config\n\
             sudo chown $(id -u):$(id -g) $HOME/.kube/config",
        )
    }

    pub fn untaint_control_plane(&self) -> CommandStep {
        CommandStep::required("kubectl taint nodes --all node-role.kubernetes.io/control-plane-")
    }

    pub fn apply_flannel(&self) -> CommandStep {
        CommandStep::required(
            "kubectl apply -f https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml",
        )
    }

    pub fn install_helm(&self) -> CommandStep {
        CommandStep::required("sudo snap install helm --classic")
    }

    pub fn add_bitnami_repo(&self) -> CommandStep {
        CommandStep::required("helm repo add bitnami https://charts.bitnami.com/bitnami")
    }

    pub fn install_prometheus(&self) -> CommandStep {
        CommandStep::required("helm install prometheus bitnami/kube-prometheus")
    }

    pub fn read_admin_conf(&self) -> CommandStep {
        CommandStep::required("sudo cat /etc/kubernetes/admin.conf")
    }

    // Worker join

    pub fn kubeadm_join(&self, endpoint: &str, token: &str, ca_cert_hash: &str) -> CommandStep {
        CommandStep::required(format!(
            "sudo kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            quote_arg(endpoint),
            quote_arg(token),
            quote_arg(ca_cert_hash)
        ))
    }

    // Reset chain. Everything after the reset itself is best-effort: a
    // partially broken node should still be released, not left stuck.

    pub fn kubeadm_reset(&self) -> CommandStep {
        CommandStep::required("sudo kubeadm reset -f")
    }

    pub fn stop_kubelet(&self) -> CommandStep {
        CommandStep::anyway("sudo systemctl stop kubelet")
    }

    pub fn stop_crio(&self) -> CommandStep {
        CommandStep::anyway("sudo systemctl stop crio.service")
    }

    pub fn link_down_cni0(&self) -> CommandStep {
        CommandStep::anyway("sudo ip link set cni0 down")
    }

    pub fn link_down_flannel(&self) -> CommandStep {
        CommandStep::anyway("sudo ip link set flannel.1 down")
    }

    pub fn delete_cni_bridge(&self) -> CommandStep {
        CommandStep::anyway("sudo ip link delete cni0 type bridge")
    }

    // Cluster manifests, templated with the target host

    pub fn metallb_address_pool(&self, ip: &str) -> CommandStep {
        CommandStep::required(format!(
            "kubectl apply -f - <<'EOF'\n\
             apiVersion: metallb.io/v1beta1\n\
             kind: IPAddressPool\n\
             metadata:\n  name: default\n  namespace: default\n\
             spec:\n  addresses:\n  - {ip}/32\n  autoAssign: true\n\
             ---\n\
             apiVersion: metallb.io/v1beta1\n\
             kind: L2Advertisement\n\
             metadata:\n  name: default\n  namespace: default\n\
             spec:\n  ipAddressPools:\n  - default\n\
             EOF"
        ))
    }

    pub fn default_storage_class(&self) -> CommandStep {
        CommandStep::required(
            "kubectl apply -f - <<'EOF'\n\
             kind: StorageClass\n\
             apiVersion: storage.k8s.io/v1\n\
             metadata:\n\
             \x20 name: local-storage\n\
             \x20 annotations:\n\
             \x20   storageclass.kubernetes.io/is-default-class: \"true\"\n\
             provisioner: kubernetes.io/no-provisioner\n\
             volumeBindingMode: Immediate\n\
             EOF",
        )
    }

    pub fn grafana_pv(&self, hostname: &str) -> CommandStep {
        CommandStep::required(local_pv_manifest("pv-grafana", "10Gi", "/srv/bosun/grafana", hostname))
    }

    pub fn postgres_pv(&self, hostname: &str) -> CommandStep {
        CommandStep::required(local_pv_manifest(
            "pv-postgres",
            "4Gi",
            "/srv/bosun/postgres",
            hostname,
        ))
    }

    pub fn grafana_ingress(&self, host: &str) -> CommandStep {
        CommandStep::required(format!(
            "kubectl apply -f - <<'EOF'\n\
             apiVersion: networking.k8s.io/v1\n\
             kind: Ingress\n\
             metadata:\n  name: grafana-ingress\n\
             spec:\n\
             \x20 ingressClassName: nginx\n\
             \x20 rules:\n\
             \x20 - host: \"{host}\"\n\
             \x20   http:\n\
             \x20     paths:\n\
             \x20     - path: /\n\
             \x20       pathType: Prefix\n\
             \x20       backend:\n\
             \x20         service:\n\
             \x20           name: grafana\n\
             \x20           port:\n\
             \x20             number: 3000\n\
             EOF"
        ))
    }

    pub fn create_pv_folders(&self) -> CommandStep {
        CommandStep::required("sudo mkdir -p /srv/bosun/postgres /srv/bosun/grafana")
    }

    pub fn reset_grafana_password(&self) -> CommandStep {
        CommandStep::required(
            "kubectl exec --namespace default $(kubectl get pods --namespace default \
             -l app.kubernetes.io/name=grafana \
             -o jsonpath=\"{.items[0].metadata.name}\") \
             -- grafana-cli admin reset-admin-password admin",
        )
    }
}

fn local_pv_manifest(name: &str, capacity: &str, path: &str, hostname: &str) -> String {
    format!(
        "kubectl apply -f - <<'EOF'\n\
         apiVersion: v1\n\
         kind: PersistentVolume\n\
         metadata:\n  name: {name}\n  labels:\n    type: local\n\
         spec:\n\
         \x20 capacity:\n    storage: {capacity}\n\
         \x20 volumeMode: Filesystem\n\
         \x20 accessModes:\n  - ReadWriteOnce\n\
         \x20 persistentVolumeReclaimPolicy: Retain\n\
         \x20 storageClassName: local-storage\n\
         \x20 local:\n    path: {path}\n\
         \x20 nodeAffinity:\n\
         \x20   required:\n\
         \x20     nodeSelectorTerms:\n\
         \x20     - matchExpressions:\n\
         \x20       - key: kubernetes.io/hostname\n\
         \x20         operator: In\n\
         \x20         values:\n\
         \x20         - {hostname}\n\
         EOF"
    )
}
