//! Viewer demo application
//!
//! Spins a small procedural scene through the renderer: a ground slab and a
//! ring of orbiting cubes. Press R to switch between the raster and
//! ray-traced paths, Esc to quit.

use auriga_engine::foundation::math::{Mat4, Vec3};
use auriga_engine::prelude::*;
use auriga_engine::render::assets::{Mesh, ModelTexture, SubMesh, Vertex};
use auriga_engine::render::vulkan::uniforms::MaterialData;
use auriga_engine::render::vulkan::Window;
use glfw::{Action, Key};
use std::time::Instant;

/// A fixed set of nodes, re-posed every frame.
struct DemoScene {
    nodes: Vec<(Mat4, ModelId, u32)>,
}

impl SceneSource for DemoScene {
    fn visible_instances(&self, cull: &Aabb) -> Vec<SceneInstance> {
        self.nodes
            .iter()
            .filter(|(transform, _, _)| {
                let position = Vec3::new(transform[(0, 3)], transform[(1, 3)], transform[(2, 3)]);
                cull.contains(position)
            })
            .map(|&(transform, model_id, mesh_index)| SceneInstance {
                transform,
                model_id,
                mesh_index,
            })
            .collect()
    }
}

impl DemoScene {
    fn pose(&mut self, cube_id: ModelId, ground_id: ModelId, time: f32) {
        self.nodes.clear();
        self.nodes.push((
            Mat4::new_translation(&Vec3::new(0.0, -2.0, 0.0))
                * Mat4::new_nonuniform_scaling(&Vec3::new(30.0, 0.5, 30.0)),
            ground_id,
            0,
        ));
        for i in 0..6 {
            let angle = time * 0.5 + i as f32 * std::f32::consts::TAU / 6.0;
            let position = Vec3::new(angle.cos() * 6.0, 1.0 + (time + i as f32).sin(), angle.sin() * 6.0);
            self.nodes.push((
                Mat4::new_translation(&position)
                    * Mat4::from_axis_angle(&Vec3::y_axis(), time + i as f32),
                cube_id,
                0,
            ));
        }
    }
}

fn cube_geometry(name: &str) -> ModelGeometry {
    let h = 0.5f32;
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, tangent, bitangent) in faces {
        let n = Vec3::from(normal);
        let t = Vec3::from(tangent);
        let b = Vec3::from(bitangent);
        let base = vertices.len() as u32;
        for (u, v) in [(0.0f32, 1.0f32), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
            let corner = n * h + t * (u * 2.0 - 1.0) * h + b * (1.0 - v * 2.0) * h;
            vertices.push(Vertex {
                position: [corner.x, corner.y, corner.z],
                normal,
                tangent: [tangent[0], tangent[1], tangent[2], 1.0],
                tex_coord: [u, v],
                color: [1.0, 1.0, 1.0],
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    let index_count = indices.len() as u32;
    ModelGeometry {
        name: name.to_string(),
        vertices,
        indices,
        materials: vec![MaterialData {
            base_color_factor: [0.8, 0.7, 0.5, 1.0],
            roughness_factor: 0.6,
            ..MaterialData::default()
        }],
        meshes: vec![Mesh {
            name: format!("{name}_mesh"),
            primitives: vec![SubMesh {
                first_index: 0,
                index_count,
                vertex_offset: 0,
                material_index: 0,
                flat_primitive_index: 0,
            }],
        }],
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = RendererConfig::load_or_default("auriga.toml")?;

    log::info!("Creating window...");
    let mut window = Window::new(
        &config.window_title,
        config.window_width,
        config.window_height,
    )?;

    log::info!("Creating renderer...");
    let mut renderer = Renderer::new(&mut window, &config)?;

    let mut models = ModelRegistry::new();
    let (cube_id, ground_id) = {
        let mut upload = renderer.upload_context();
        let cube_id =
            models.register_model(&mut upload, cube_geometry("cube"), Vec::<ModelTexture>::new())?;
        let ground_id = models.register_model(
            &mut upload,
            cube_geometry("ground"),
            Vec::<ModelTexture>::new(),
        )?;
        (cube_id, ground_id)
    };

    let mut camera = Camera::perspective(Vec3::new(8.0, 5.0, 14.0), 45.0, 0.1, 1000.0);
    camera.look_at(Vec3::new(0.0, 0.0, 0.0), Vec3::y());

    let mut scene = DemoScene { nodes: Vec::new() };
    let light_direction = Vec3::new(-0.4, -1.0, -0.3);
    let mut use_ray_tracing = false;
    let start = Instant::now();

    while !window.should_close() {
        window.poll_events();
        for (key, action) in window.take_key_events() {
            match (key, action) {
                (Key::Escape, Action::Press) => window.set_should_close(true),
                (Key::R, Action::Press) => {
                    use_ray_tracing = !use_ray_tracing;
                    log::info!(
                        "Render path: {}",
                        if use_ray_tracing { "ray tracing" } else { "raster" }
                    );
                }
                _ => {}
            }
        }

        scene.pose(cube_id, ground_id, start.elapsed().as_secs_f32());

        let inputs = FrameInputs {
            camera: &camera,
            light_direction,
            use_ray_tracing,
        };
        renderer.draw_frame(&mut window, &models, &scene, &inputs, None)?;
    }

    renderer.destroy(&mut models);
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
