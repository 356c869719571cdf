//! Patch engine: writes rendered prompt text into a workflow graph and
//! inserts the optional ControlNet/IPAdapter subgraphs.
//!
//! A session works on an in-memory snapshot of the document; the caller
//! serializes the result only after every requested mutation succeeded, so a
//! failure partway leaves the original untouched. All subgraph insertion is
//! role-keyed upsert, which keeps repeated application idempotent; the one
//! exception is the IPAdapter image loader, which is created fresh on every
//! invocation so several reference images can coexist.
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};
use crate::utils::images::stage_input_image;
use crate::workflow::graph::{node_ref, roles, RoleIndex, WorkflowGraph};

/// Ids of the two text-encoder nodes receiving the rendered prompt.
#[derive(Debug, Clone)]
pub struct TextNodes {
    pub positive: String,
    pub negative: String,
}

impl Default for TextNodes {
    fn default() -> Self {
        // Node ids of the stock ComfyUI text-to-image template.
        TextNodes {
            positive: "6".to_string(),
            negative: "7".to_string(),
        }
    }
}

/// Independent parameter overrides applied to existing loader nodes.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub lora_strength_model: Option<f64>,
    pub lora_strength_clip: Option<f64>,
    pub clip_stop_layer: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ControlNetArgs {
    pub model: Option<String>,
    pub image: Option<PathBuf>,
    pub strength: f64,
    pub start: f64,
    pub end: f64,
}

impl Default for ControlNetArgs {
    fn default() -> Self {
        ControlNetArgs {
            model: None,
            image: None,
            strength: 0.9,
            start: 0.0,
            end: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpAdapterArgs {
    pub image: Option<PathBuf>,
    pub preset: String,
    pub community: bool,
    pub community_preset: String,
    pub weight: f64,
    pub weight_type: String,
    pub combine_embeds: String,
    pub start_at: f64,
    pub end_at: f64,
    pub embeds_scaling: String,
}

impl Default for IpAdapterArgs {
    fn default() -> Self {
        IpAdapterArgs {
            image: None,
            preset: "PLUS (high strength)".to_string(),
            community: false,
            community_preset: "Composition".to_string(),
            weight: 0.85,
            weight_type: "style and composition".to_string(),
            combine_embeds: "average".to_string(),
            start_at: 0.0,
            end_at: 0.7,
            embeds_scaling: "K+mean(V) w/ C penalty".to_string(),
        }
    }
}

/// One patch application over one graph snapshot.
pub struct PatchSession {
    graph: WorkflowGraph,
    roles: RoleIndex,
}

impl PatchSession {
    pub fn new(document: &Value) -> AppResult<Self> {
        let graph = WorkflowGraph::from_value(document)?;
        let roles = RoleIndex::build(&graph);
        Ok(PatchSession { graph, roles })
    }

    /// Overwrite the `text` inputs of the two caller-specified encoder nodes.
    pub fn inject_prompt_text(
        &mut self,
        nodes: &TextNodes,
        positive: &str,
        negative: &str,
    ) -> AppResult<()> {
        self.expect_role(&nodes.positive, roles::TEXT_ENCODER)?;
        self.expect_role(&nodes.negative, roles::TEXT_ENCODER)?;
        self.graph
            .set_input(&nodes.positive, "text", Value::String(positive.to_string()))?;
        self.graph
            .set_input(&nodes.negative, "text", Value::String(negative.to_string()))?;
        tracing::debug!(
            "wrote prompt text into encoder nodes {} and {}",
            nodes.positive,
            nodes.negative
        );
        Ok(())
    }

    /// Apply the requested LoRA-strength and CLIP-stop-layer overrides.
    pub fn apply_overrides(&mut self, overrides: &Overrides) -> AppResult<()> {
        if overrides.lora_strength_model.is_some() || overrides.lora_strength_clip.is_some() {
            let id = self
                .roles
                .get(roles::LORA_LOADER)
                .ok_or_else(|| {
                    AppError::NodeNotFound(
                        "LoRA loader node not found; cannot set strengths".to_string(),
                    )
                })?
                .to_string();
            if let Some(strength) = overrides.lora_strength_model {
                self.graph.set_input(&id, "strength_model", json!(strength))?;
            }
            if let Some(strength) = overrides.lora_strength_clip {
                self.graph.set_input(&id, "strength_clip", json!(strength))?;
            }
        }
        if let Some(layer) = overrides.clip_stop_layer {
            let id = self
                .roles
                .get(roles::CLIP_LAYER)
                .ok_or_else(|| {
                    AppError::NodeNotFound(
                        "CLIPSetLastLayer node not found; cannot set stop layer".to_string(),
                    )
                })?
                .to_string();
            self.graph.set_input(&id, "stop_at_clip_layer", json!(layer))?;
        }
        Ok(())
    }

    /// Insert (or refresh) the ControlNet conditioning subgraph and rewire
    /// the sampler's positive/negative inputs through it.
    pub fn insert_controlnet(
        &mut self,
        args: &ControlNetArgs,
        text_nodes: &TextNodes,
        input_dir: &Path,
    ) -> AppResult<()> {
        let (Some(model), Some(image)) = (&args.model, &args.image) else {
            return Err(AppError::MissingArgument(
                "ControlNet insertion requires a model name and a reference image".to_string(),
            ));
        };
        let image_name = stage_input_image(image, input_dir)?;

        let control_id = self.upsert_role(
            roles::CONTROLNET_LOADER,
            inputs(&[("control_net_name", json!(model))]),
        );
        let image_id = self.upsert_role(
            roles::IMAGE_LOADER,
            inputs(&[("image", json!(image_name))]),
        );
        let apply_id = self.upsert_role(
            roles::CONTROLNET_APPLY,
            inputs(&[
                ("positive", node_ref(&text_nodes.positive, 0)),
                ("negative", node_ref(&text_nodes.negative, 0)),
                ("control_net", node_ref(&control_id, 0)),
                ("image", node_ref(&image_id, 0)),
                ("strength", json!(args.strength)),
                ("start_percent", json!(args.start)),
                ("end_percent", json!(args.end)),
            ]),
        );

        let sampler_id = self
            .roles
            .get(roles::SAMPLER)
            .ok_or_else(|| {
                AppError::NodeNotFound(
                    "KSampler node not found; cannot insert ControlNet".to_string(),
                )
            })?
            .to_string();
        self.graph
            .set_input(&sampler_id, "positive", node_ref(&apply_id, 0))?;
        self.graph
            .set_input(&sampler_id, "negative", node_ref(&apply_id, 1))?;
        tracing::info!(
            "ControlNet subgraph in place: loader {}, image {}, apply {}",
            control_id,
            image_id,
            apply_id
        );
        Ok(())
    }

    /// Insert (or refresh) the IPAdapter subgraph and rewire the sampler's
    /// model input through it. Requires an existing LoRA loader; the image
    /// loader is created fresh on every call.
    pub fn insert_ipadapter(&mut self, args: &IpAdapterArgs, input_dir: &Path) -> AppResult<()> {
        let Some(image) = &args.image else {
            return Err(AppError::MissingArgument(
                "IPAdapter insertion requires a reference image".to_string(),
            ));
        };
        let lora_id = self
            .roles
            .get(roles::LORA_LOADER)
            .ok_or_else(|| {
                AppError::DependencyMissing(
                    "LoRA loader node not found; cannot add IPAdapter".to_string(),
                )
            })?
            .to_string();
        let image_name = stage_input_image(image, input_dir)?;

        let loader_role = if args.community {
            roles::IPADAPTER_LOADER_COMMUNITY
        } else {
            roles::IPADAPTER_LOADER
        };
        let preset = if args.community {
            &args.community_preset
        } else {
            &args.preset
        };
        let loader_id = self.upsert_role(
            loader_role,
            inputs(&[
                ("model", node_ref(&lora_id, 0)),
                ("preset", json!(preset)),
            ]),
        );

        let image_id = self.graph.allocate_id();
        self.graph.upsert(
            &image_id,
            roles::IMAGE_LOADER,
            inputs(&[("image", json!(image_name))]),
        );

        let advanced_id = self.upsert_role(
            roles::IPADAPTER_ADVANCED,
            inputs(&[
                ("model", node_ref(&loader_id, 0)),
                ("ipadapter", node_ref(&loader_id, 1)),
                ("image", node_ref(&image_id, 0)),
                ("weight", json!(args.weight)),
                ("weight_type", json!(args.weight_type)),
                ("combine_embeds", json!(args.combine_embeds)),
                ("start_at", json!(args.start_at)),
                ("end_at", json!(args.end_at)),
                ("embeds_scaling", json!(args.embeds_scaling)),
            ]),
        );

        let sampler_id = self
            .roles
            .get(roles::SAMPLER)
            .ok_or_else(|| {
                AppError::NodeNotFound(
                    "KSampler node not found; cannot add IPAdapter".to_string(),
                )
            })?
            .to_string();
        self.graph
            .set_input(&sampler_id, "model", node_ref(&advanced_id, 0))?;
        tracing::info!(
            "IPAdapter subgraph in place: loader {}, image {}, advanced {}",
            loader_id,
            image_id,
            advanced_id
        );
        Ok(())
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn into_value(self) -> Value {
        self.graph.into_value()
    }

    fn expect_role(&self, id: &str, expected: &str) -> AppResult<()> {
        match self.graph.role_of(id) {
            Some(role) if role == expected => Ok(()),
            _ => Err(AppError::RoleMismatch {
                node: id.to_string(),
                expected: expected.to_string(),
            }),
        }
    }

    /// Find the first node of `role`, or create one under a freshly
    /// allocated id. Either way the provided inputs are merged in.
    fn upsert_role(&mut self, role: &str, node_inputs: Map<String, Value>) -> String {
        match self.roles.get(role) {
            Some(id) => {
                let id = id.to_string();
                self.graph.upsert(&id, role, node_inputs);
                id
            }
            None => {
                let id = self.graph.allocate_id();
                self.graph.upsert(&id, role, node_inputs);
                self.roles.register(role, &id);
                id
            }
        }
    }
}

fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_graph() -> Value {
        json!({
            "1": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "base.safetensors"}},
            "2": {"class_type": "CLIPSetLastLayer", "inputs": {"clip": ["1", 1], "stop_at_clip_layer": -1}},
            "4": {"class_type": "LoraLoader", "inputs": {
                "model": ["1", 0], "clip": ["2", 0],
                "lora_name": "style.safetensors",
                "strength_model": 1.0, "strength_clip": 1.0
            }},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
            "3": {"class_type": "KSampler", "inputs": {
                "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0]
            }}
        })
    }

    fn staged_image(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("ref.png");
        fs::write(&path, b"png bytes").unwrap();
        path
    }

    #[test]
    fn injects_text_into_encoder_nodes() {
        let document = json!({
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}
        });
        let mut session = PatchSession::new(&document).unwrap();
        session
            .inject_prompt_text(&TextNodes::default(), "X", "lowres")
            .unwrap();
        let result = session.into_value();
        assert_eq!(result["6"]["inputs"]["text"], "X");
        assert_eq!(result["7"]["inputs"]["text"], "lowres");
    }

    #[test]
    fn rejects_wrong_encoder_role_or_missing_node() {
        let document = json!({
            "6": {"class_type": "KSampler", "inputs": {}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}
        });
        let mut session = PatchSession::new(&document).unwrap();
        let err = session
            .inject_prompt_text(&TextNodes::default(), "X", "Y")
            .unwrap_err();
        assert!(matches!(err, AppError::RoleMismatch { node, .. } if node == "6"));

        let document = json!({"7": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}});
        let mut session = PatchSession::new(&document).unwrap();
        let err = session
            .inject_prompt_text(&TextNodes::default(), "X", "Y")
            .unwrap_err();
        assert!(matches!(err, AppError::RoleMismatch { node, .. } if node == "6"));
    }

    #[test]
    fn applies_lora_and_clip_overrides() {
        let mut session = PatchSession::new(&base_graph()).unwrap();
        session
            .apply_overrides(&Overrides {
                lora_strength_model: Some(0.6),
                lora_strength_clip: Some(0.7),
                clip_stop_layer: Some(-2),
            })
            .unwrap();
        let result = session.into_value();
        assert_eq!(result["4"]["inputs"]["strength_model"], 0.6);
        assert_eq!(result["4"]["inputs"]["strength_clip"], 0.7);
        assert_eq!(result["4"]["inputs"]["lora_name"], "style.safetensors");
        assert_eq!(result["2"]["inputs"]["stop_at_clip_layer"], -2);
    }

    #[test]
    fn overrides_require_their_target_nodes() {
        let document = json!({"3": {"class_type": "KSampler", "inputs": {}}});
        let mut session = PatchSession::new(&document).unwrap();
        let err = session
            .apply_overrides(&Overrides {
                lora_strength_model: Some(0.5),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AppError::NodeNotFound(_)));

        let mut session = PatchSession::new(&document).unwrap();
        let err = session
            .apply_overrides(&Overrides {
                clip_stop_layer: Some(-2),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, AppError::NodeNotFound(_)));
    }

    #[test]
    fn controlnet_requires_model_and_image_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let original = base_graph();
        let mut session = PatchSession::new(&original).unwrap();
        let err = session
            .insert_controlnet(
                &ControlNetArgs {
                    model: Some("depth.safetensors".to_string()),
                    image: None,
                    ..Default::default()
                },
                &TextNodes::default(),
                &dir.path().join("input"),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::MissingArgument(_)));
        assert_eq!(session.into_value(), original);
        assert!(!dir.path().join("input").exists());
    }

    #[test]
    fn controlnet_missing_reference_image_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PatchSession::new(&base_graph()).unwrap();
        let err = session
            .insert_controlnet(
                &ControlNetArgs {
                    model: Some("depth.safetensors".to_string()),
                    image: Some(dir.path().join("absent.png")),
                    ..Default::default()
                },
                &TextNodes::default(),
                &dir.path().join("input"),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::FileNotFound(_)));
    }

    #[test]
    fn controlnet_inserts_subgraph_and_rewires_sampler() {
        let dir = tempfile::tempdir().unwrap();
        let image = staged_image(&dir);
        let mut session = PatchSession::new(&base_graph()).unwrap();
        session
            .insert_controlnet(
                &ControlNetArgs {
                    model: Some("depth.safetensors".to_string()),
                    image: Some(image),
                    ..Default::default()
                },
                &TextNodes::default(),
                &dir.path().join("input"),
            )
            .unwrap();
        let result = session.into_value();

        // max existing id was 7, so the three new nodes take 8, 9, 10
        assert_eq!(result["8"]["class_type"], "ControlNetLoader");
        assert_eq!(result["8"]["inputs"]["control_net_name"], "depth.safetensors");
        assert_eq!(result["9"]["class_type"], "LoadImage");
        assert_eq!(result["9"]["inputs"]["image"], "ref.png");
        assert_eq!(result["10"]["class_type"], "ControlNetApplyAdvanced");
        assert_eq!(result["10"]["inputs"]["positive"], json!(["6", 0]));
        assert_eq!(result["10"]["inputs"]["negative"], json!(["7", 0]));
        assert_eq!(result["10"]["inputs"]["control_net"], json!(["8", 0]));
        assert_eq!(result["10"]["inputs"]["image"], json!(["9", 0]));
        assert_eq!(result["10"]["inputs"]["strength"], 0.9);
        assert_eq!(result["3"]["inputs"]["positive"], json!(["10", 0]));
        assert_eq!(result["3"]["inputs"]["negative"], json!(["10", 1]));
    }

    #[test]
    fn controlnet_application_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let image = staged_image(&dir);
        let input_dir = dir.path().join("input");
        let args = ControlNetArgs {
            model: Some("depth.safetensors".to_string()),
            image: Some(image),
            ..Default::default()
        };

        let mut first = PatchSession::new(&base_graph()).unwrap();
        first
            .insert_controlnet(&args, &TextNodes::default(), &input_dir)
            .unwrap();
        let once = first.into_value();

        let mut second = PatchSession::new(&once).unwrap();
        second
            .insert_controlnet(&args, &TextNodes::default(), &input_dir)
            .unwrap();
        let twice = second.into_value();

        assert_eq!(once, twice);
    }

    #[test]
    fn ipadapter_requires_image_then_lora_loader() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PatchSession::new(&base_graph()).unwrap();
        let err = session
            .insert_ipadapter(&IpAdapterArgs::default(), &dir.path().join("input"))
            .unwrap_err();
        assert!(matches!(err, AppError::MissingArgument(_)));

        let document = json!({
            "3": {"class_type": "KSampler", "inputs": {}}
        });
        let mut session = PatchSession::new(&document).unwrap();
        let err = session
            .insert_ipadapter(
                &IpAdapterArgs {
                    image: Some(staged_image(&dir)),
                    ..Default::default()
                },
                &dir.path().join("input"),
            )
            .unwrap_err();
        assert!(matches!(err, AppError::DependencyMissing(_)));
    }

    #[test]
    fn ipadapter_inserts_subgraph_and_rewires_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PatchSession::new(&base_graph()).unwrap();
        session
            .insert_ipadapter(
                &IpAdapterArgs {
                    image: Some(staged_image(&dir)),
                    ..Default::default()
                },
                &dir.path().join("input"),
            )
            .unwrap();
        let result = session.into_value();

        assert_eq!(result["8"]["class_type"], "IPAdapterUnifiedLoader");
        assert_eq!(result["8"]["inputs"]["model"], json!(["4", 0]));
        assert_eq!(result["8"]["inputs"]["preset"], "PLUS (high strength)");
        assert_eq!(result["9"]["class_type"], "LoadImage");
        assert_eq!(result["10"]["class_type"], "IPAdapterAdvanced");
        assert_eq!(result["10"]["inputs"]["model"], json!(["8", 0]));
        assert_eq!(result["10"]["inputs"]["ipadapter"], json!(["8", 1]));
        assert_eq!(result["10"]["inputs"]["image"], json!(["9", 0]));
        assert_eq!(result["10"]["inputs"]["weight"], 0.85);
        assert_eq!(result["3"]["inputs"]["model"], json!(["10", 0]));
    }

    #[test]
    fn ipadapter_community_flag_switches_loader_and_preset() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = PatchSession::new(&base_graph()).unwrap();
        session
            .insert_ipadapter(
                &IpAdapterArgs {
                    image: Some(staged_image(&dir)),
                    community: true,
                    ..Default::default()
                },
                &dir.path().join("input"),
            )
            .unwrap();
        let result = session.into_value();
        assert_eq!(result["8"]["class_type"], "IPAdapterUnifiedLoaderCommunity");
        assert_eq!(result["8"]["inputs"]["preset"], "Composition");
    }

    #[test]
    fn ipadapter_adds_a_fresh_image_node_per_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("input");
        let args = IpAdapterArgs {
            image: Some(staged_image(&dir)),
            ..Default::default()
        };

        let mut first = PatchSession::new(&base_graph()).unwrap();
        first.insert_ipadapter(&args, &input_dir).unwrap();
        let once = first.into_value();

        let mut second = PatchSession::new(&once).unwrap();
        second.insert_ipadapter(&args, &input_dir).unwrap();
        let twice = second.into_value();

        let count = |v: &Value| {
            v.as_object()
                .unwrap()
                .values()
                .filter(|n| n["class_type"] == "LoadImage")
                .count()
        };
        assert_eq!(count(&once), 1);
        assert_eq!(count(&twice), 2, "each invocation adds a reference image");
        // loader and advanced nodes stay singular
        let advanced = |v: &Value| {
            v.as_object()
                .unwrap()
                .values()
                .filter(|n| n["class_type"] == "IPAdapterAdvanced")
                .count()
        };
        assert_eq!(advanced(&twice), 1);
    }

    #[test]
    fn controlnet_and_ipadapter_share_the_id_counter() {
        let dir = tempfile::tempdir().unwrap();
        let image = staged_image(&dir);
        let input_dir = dir.path().join("input");
        let mut session = PatchSession::new(&base_graph()).unwrap();
        session
            .insert_controlnet(
                &ControlNetArgs {
                    model: Some("depth.safetensors".to_string()),
                    image: Some(image.clone()),
                    ..Default::default()
                },
                &TextNodes::default(),
                &input_dir,
            )
            .unwrap();
        session
            .insert_ipadapter(
                &IpAdapterArgs {
                    image: Some(image),
                    ..Default::default()
                },
                &input_dir,
            )
            .unwrap();
        let result = session.into_value();

        let ids: Vec<&String> = result.as_object().unwrap().keys().collect();
        let unique: std::collections::HashSet<&&String> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len(), "no id reuse across insertions");
        // controlnet took 8..=10, ipadapter continues at 11
        assert_eq!(result["11"]["class_type"], "IPAdapterUnifiedLoader");
        assert_eq!(result["12"]["class_type"], "LoadImage");
        assert_eq!(result["13"]["class_type"], "IPAdapterAdvanced");
        assert_eq!(result["3"]["inputs"]["model"], json!(["13", 0]));
    }
}
