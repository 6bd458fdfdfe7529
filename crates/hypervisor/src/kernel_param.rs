// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use crate::{VM_ROOTFS_DRIVER_BLK, VM_ROOTFS_DRIVER_PMEM};

// Port where the agent sends early logs when the VM carries no console
// device.
const VSOCK_LOGS_PORT: &str = "1025";

const KERNEL_KV_DELIMITER: &str = "=";
const KERNEL_PARAM_DELIMITER: &str = " ";

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: &str, value: &str) -> Self {
        Param {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

#[derive(Debug, PartialEq, Default)]
pub struct KernelParams {
    params: Vec<Param>,
}

impl KernelParams {
    pub(crate) fn new(debug: bool) -> Self {
        // default kernel params
        let mut params = vec![
            Param::new("reboot", "k"),
            Param::new("panic", "1"),
            Param::new("systemd.unit", "virtrun.target"),
            Param::new("systemd.mask", "systemd-networkd.service"),
            Param::new("systemd.mask", "systemd-networkd.socket"),
        ];

        if debug {
            params.push(Param::new("agent.log_vport", VSOCK_LOGS_PORT));
        }

        Self { params }
    }

    pub(crate) fn new_rootfs_kernel_params(rootfs_driver: &str) -> Self {
        let params = match rootfs_driver {
            VM_ROOTFS_DRIVER_BLK => {
                vec![
                    Param::new("root", "/dev/vda1"),
                    Param::new("rootflags", "data=ordered,errors=remount-ro ro"),
                    Param::new("rootfstype", "ext4"),
                ]
            }
            VM_ROOTFS_DRIVER_PMEM => {
                vec![
                    Param::new("root", "/dev/pmem0p1"),
                    Param::new("rootflags", "data=ordered,errors=remount-ro,dax ro"),
                    Param::new("rootfstype", "ext4"),
                ]
            }
            _ => vec![],
        };
        Self { params }
    }

    pub(crate) fn append(&mut self, params: &mut KernelParams) {
        self.params.append(&mut params.params);
    }

    pub(crate) fn from_string(params_string: &str) -> Self {
        let mut params = vec![];

        for param in split_params(params_string) {
            if param.is_empty() {
                continue;
            }

            let ps: Vec<&str> = param.splitn::<_>(2, KERNEL_KV_DELIMITER).collect();

            if ps.len() == 2 {
                params.push(Param {
                    key: String::from(ps[0]),
                    value: String::from(ps[1]),
                });
            } else {
                params.push(Param {
                    key: String::from(ps[0]),
                    value: String::from(""),
                });
            }
        }

        Self { params }
    }

    pub(crate) fn to_string(&self) -> String {
        let mut parameters: Vec<String> = Vec::new();

        for param in &self.params {
            if param.key.is_empty() && param.value.is_empty() {
                continue;
            } else if param.key.is_empty() {
                parameters.push(param.value.to_string());
            } else if param.value.is_empty() {
                parameters.push(param.key.to_string());
            } else {
                parameters.push(format!(
                    "{}{}{}",
                    param.key, KERNEL_KV_DELIMITER, param.value
                ));
            }
        }

        parameters.join(KERNEL_PARAM_DELIMITER)
    }
}

// Split on spaces, treating a double-quoted run as a single token so values
// like dm-mod.create="dmverity,,,ro,0 736328" survive intact.
fn split_params(params_string: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut in_quotes = false;

    for c in params_string.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ' ' if !in_quotes => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_params() {
        let expect_params_string = "k1=v1 k2=v2 k3=v3".to_string();
        let expect_params = KernelParams {
            params: vec![
                Param::new("k1", "v1"),
                Param::new("k2", "v2"),
                Param::new("k3", "v3"),
            ],
        };

        // check kernel params from string
        let kernel_params = KernelParams::from_string(&expect_params_string);
        assert_eq!(kernel_params, expect_params);

        // check kernel params to string
        let kernel_params_string = expect_params.to_string();
        assert_eq!(kernel_params_string, expect_params_string);
    }

    #[test]
    fn test_key_only_and_value_only_params() {
        let params = KernelParams {
            params: vec![
                Param::new("panic", "1"),
                Param::new("maxcpus", "8"),
                Param::new("quiet", ""),
                Param::new("", "standalone"),
            ],
        };
        assert_eq!(params.to_string(), "panic=1 maxcpus=8 quiet standalone");

        let parsed = KernelParams::from_string("panic=1 maxcpus=8 quiet");
        assert_eq!(
            parsed,
            KernelParams {
                params: vec![
                    Param::new("panic", "1"),
                    Param::new("maxcpus", "8"),
                    Param::new("quiet", ""),
                ],
            }
        );
    }

    #[test]
    fn test_quoted_values_are_not_split() {
        let line = r#"console=ttyS0 dm-mod.create="dmverity,,,ro,0 736328 verity" quiet"#;
        let params = KernelParams::from_string(line);
        assert_eq!(
            params,
            KernelParams {
                params: vec![
                    Param::new("console", "ttyS0"),
                    Param::new("dm-mod.create", r#""dmverity,,,ro,0 736328 verity""#),
                    Param::new("quiet", ""),
                ],
            }
        );
        // round trip preserves the quoted run
        assert_eq!(params.to_string(), line);
    }

    #[test]
    fn test_round_trip_simple_params() {
        for line in &["a=b c d=e", "quiet", "root=/dev/vda1 ro"] {
            let params = KernelParams::from_string(line);
            assert_eq!(&params.to_string(), line);
        }
    }
}
