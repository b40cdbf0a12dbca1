//! FBX 场景到网格
//!
//! `Objects` 下的对象通过 `Connections` 里的 `C` 记录连接：
//!
//! - Geometry → Model（OO）
//! - Material → Model（OO）
//! - Texture → Material（OP，属性名为通道，例如 `DiffuseColor`）
//!
//! 每个挂了 Geometry 的 Model 生成一个 `MeshData`，顶点与控制点一一对应。

use std::collections::HashMap;
use std::path::PathBuf;

use super::binary::{Document, Node, Property};
use crate::core::error::{MeshLoadError, Result};
use crate::geometry::mesh::{Material, MeshData, ModelData};
use crate::geometry::vertex::Vertex;

/// UV 集合的首选名称
const PREFERRED_UV_SET: &str = "map1";

/// 对象名形如 `Name\0\x01Class`
fn object_name(node: &Node) -> String {
    node.property(1)
        .and_then(Property::as_str)
        .map(|s| s.split("\0\x01").next().unwrap_or(s).to_string())
        .unwrap_or_default()
}

fn object_id(node: &Node) -> Option<i64> {
    node.property(0).and_then(Property::as_i64)
}

struct Connection {
    child: i64,
    parent: i64,
    property: Option<String>,
}

fn connections(doc: &Document) -> Vec<Connection> {
    let Some(root) = doc.node("Connections") else {
        return Vec::new();
    };
    root.children_named("C")
        .filter_map(|c| {
            Some(Connection {
                child: c.property(1)?.as_i64()?,
                parent: c.property(2)?.as_i64()?,
                property: c.property(3).and_then(Property::as_str).map(str::to_string),
            })
        })
        .collect()
}

/// 映射方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    ByPolygonVertex,
    ByControlPoint,
    AllSame,
}

/// 一个图层元素（法线或 UV）
struct LayerElement {
    mapping: Mapping,
    components: usize,
    values: Vec<f64>,
    /// IndexToDirect 时的索引
    indices: Option<Vec<i32>>,
}

impl LayerElement {
    fn parse(node: &Node, values_name: &str, index_name: &str, components: usize) -> Result<Self> {
        let mapping = match node
            .child("MappingInformationType")
            .and_then(|n| n.property(0))
            .and_then(Property::as_str)
            .unwrap_or("ByPolygonVertex")
        {
            "ByPolygonVertex" => Mapping::ByPolygonVertex,
            "ByControlPoint" | "ByVertice" | "ByVertex" => Mapping::ByControlPoint,
            "AllSame" => Mapping::AllSame,
            other => {
                return Err(MeshLoadError::UnsupportedFormat(format!(
                    "{} mapping '{}' is not supported",
                    node.name, other
                ))
                .into())
            }
        };

        let reference = node
            .child("ReferenceInformationType")
            .and_then(|n| n.property(0))
            .and_then(Property::as_str)
            .unwrap_or("Direct");

        let values = node
            .child(values_name)
            .and_then(|n| n.property(0))
            .and_then(Property::to_f64_vec)
            .ok_or_else(|| MeshLoadError::ParseError(format!("{} has no {} array", node.name, values_name)))?;

        let indices = if reference == "IndexToDirect" || reference == "Index" {
            Some(
                node.child(index_name)
                    .and_then(|n| n.property(0))
                    .and_then(Property::to_i32_vec)
                    .ok_or_else(|| MeshLoadError::ParseError(format!("{} has no {} array", node.name, index_name)))?,
            )
        } else {
            None
        };

        Ok(Self {
            mapping,
            components,
            values,
            indices,
        })
    }

    /// 第 `polygon_vertex` 个多边形顶点（控制点 `control_point`）的值
    fn value(&self, polygon_vertex: usize, control_point: usize) -> Option<&[f64]> {
        let slot = match self.mapping {
            Mapping::ByPolygonVertex => polygon_vertex,
            Mapping::ByControlPoint => control_point,
            Mapping::AllSame => 0,
        };
        let direct = match &self.indices {
            Some(indices) => usize::try_from(*indices.get(slot)?).ok()?,
            None => slot,
        };
        let start = direct * self.components;
        self.values.get(start..start + self.components)
    }
}

/// 解码 `PolygonVertexIndex`，负数 `!i` 表示多边形最后一个顶点
fn polygons(indices: &[i32]) -> Result<Vec<Vec<usize>>> {
    let mut polygons = Vec::new();
    let mut current = Vec::new();
    for &raw in indices {
        let (index, last) = if raw < 0 { (!raw, true) } else { (raw, false) };
        current.push(index as usize);
        if last {
            polygons.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        return Err(MeshLoadError::InvalidGeometry("last polygon is not terminated".to_string()).into());
    }
    Ok(polygons)
}

fn build_mesh(name: String, geometry: &Node) -> Result<MeshData> {
    let positions = geometry
        .child("Vertices")
        .and_then(|n| n.property(0))
        .and_then(Property::to_f64_vec)
        .ok_or_else(|| MeshLoadError::ParseError(format!("geometry '{}' has no vertices", name)))?;
    let polygon_indices = geometry
        .child("PolygonVertexIndex")
        .and_then(|n| n.property(0))
        .and_then(Property::to_i32_vec)
        .ok_or_else(|| MeshLoadError::ParseError(format!("geometry '{}' has no polygons", name)))?;

    let control_points = positions.len() / 3;
    let mut vertices: Vec<Vertex> = positions
        .chunks_exact(3)
        .map(|p| Vertex::new([p[0] as f32, p[1] as f32, p[2] as f32], [0.0; 3], [0.0; 2]))
        .collect();

    let polygons = polygons(&polygon_indices)?;
    if let Some(bad) = polygons.iter().flatten().find(|&&cp| cp >= control_points) {
        return Err(MeshLoadError::InvalidGeometry(format!(
            "control point {} out of range ({} points)",
            bad, control_points
        ))
        .into());
    }

    // 法线：同一控制点有多个法线时取平均
    if let Some(node) = geometry.child("LayerElementNormal") {
        let normals = LayerElement::parse(node, "Normals", "NormalsIndex", 3)?;
        let mut gathered: Vec<Vec<[f64; 3]>> = vec![Vec::new(); control_points];
        let mut polygon_vertex = 0;
        for polygon in &polygons {
            for &cp in polygon {
                if let Some(n) = normals.value(polygon_vertex, cp) {
                    gathered[cp].push([n[0], n[1], n[2]]);
                }
                polygon_vertex += 1;
            }
        }

        for (vertex, list) in vertices.iter_mut().zip(&gathered) {
            vertex.normal = match list.len() {
                0 => continue,
                1 => [list[0][0] as f32, list[0][1] as f32, list[0][2] as f32],
                count => {
                    let sum = list.iter().fold([0.0f64; 3], |acc, n| [acc[0] + n[0], acc[1] + n[1], acc[2] + n[2]]);
                    let avg = nalgebra::Vector3::new(sum[0], sum[1], sum[2]) / count as f64;
                    let n = avg.try_normalize(f64::EPSILON).unwrap_or(avg);
                    [n.x as f32, n.y as f32, n.z as f32]
                }
            };
        }
    }

    // UV：最后一次写入生效
    let uv_layers: Vec<&Node> = geometry.children_named("LayerElementUV").collect();
    let uv_layer = uv_layers
        .iter()
        .find(|n| n.child("Name").and_then(|c| c.property(0)).and_then(Property::as_str) == Some(PREFERRED_UV_SET))
        .or_else(|| uv_layers.first());
    if let Some(node) = uv_layer {
        let uvs = LayerElement::parse(node, "UV", "UVIndex", 2)?;
        let mut polygon_vertex = 0;
        for polygon in &polygons {
            for &cp in polygon {
                if let Some(uv) = uvs.value(polygon_vertex, cp) {
                    vertices[cp].texcoord = [uv[0] as f32, uv[1] as f32];
                }
                polygon_vertex += 1;
            }
        }
    }

    // 扇形三角化
    let mut indices = Vec::with_capacity(polygon_indices.len());
    for polygon in &polygons {
        for i in 1..polygon.len().saturating_sub(1) {
            indices.extend_from_slice(&[polygon[0] as u32, polygon[i] as u32, polygon[i + 1] as u32]);
        }
    }

    Ok(MeshData {
        name: Some(name),
        vertices,
        indices,
        material: Material::default(),
    })
}

fn diffuse_color(material: &Node) -> Option<[f32; 3]> {
    let properties = material.child("Properties70")?;
    let color = |name: &str| {
        properties
            .children_named("P")
            .find(|p| p.property(0).and_then(Property::as_str) == Some(name))
            .and_then(|p| {
                Some([
                    p.property(4)?.as_f64()? as f32,
                    p.property(5)?.as_f64()? as f32,
                    p.property(6)?.as_f64()? as f32,
                ])
            })
    };
    color("DiffuseColor").or_else(|| color("Diffuse"))
}

fn texture_file(texture: &Node) -> Option<PathBuf> {
    ["FileName", "RelativeFilename", "Filename"]
        .iter()
        .filter_map(|name| texture.child(name)?.property(0)?.as_str())
        .find(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// 连到 `parent` 的 `kind` 类对象及连接的属性名
fn sources<'a>(
    connections: &'a [Connection],
    by_id: &HashMap<i64, &'a Node>,
    parent: i64,
    kind: &str,
) -> Vec<(&'a Node, Option<&'a str>)> {
    connections
        .iter()
        .filter(|c| c.parent == parent)
        .filter_map(|c| by_id.get(&c.child).map(|n| (*n, c.property.as_deref())))
        .filter(|(n, _)| n.name == kind)
        .collect()
}

/// 从节点树构建模型
pub fn build_model(doc: &Document) -> Result<ModelData> {
    let objects = doc
        .node("Objects")
        .ok_or_else(|| MeshLoadError::ParseError("FBX file has no Objects section".to_string()))?;

    let by_id: HashMap<i64, &Node> = objects
        .children
        .iter()
        .filter_map(|n| Some((object_id(n)?, n)))
        .collect();
    let connections = connections(doc);

    let mut meshes = Vec::new();
    for model in objects.children_named("Model") {
        let Some(model_id) = object_id(model) else {
            continue;
        };
        let Some((geometry, _)) = sources(&connections, &by_id, model_id, "Geometry").into_iter().next() else {
            continue;
        };

        let mut mesh = build_mesh(object_name(model), geometry)?;

        // 只取第一个材质
        if let Some((material, _)) = sources(&connections, &by_id, model_id, "Material").into_iter().next() {
            let textures = object_id(material)
                .map(|id| sources(&connections, &by_id, id, "Texture"))
                .unwrap_or_default();
            let texture = textures
                .iter()
                .find(|(_, channel)| matches!(channel, Some("DiffuseColor") | Some("Diffuse")))
                .or_else(|| textures.first())
                .and_then(|(node, _)| texture_file(node));

            mesh.material = Material {
                name: object_name(material),
                diffuse: diffuse_color(material).unwrap_or(Material::default().diffuse),
                texture,
            };
        }

        tracing::debug!(
            mesh = mesh.name.as_deref().unwrap_or(""),
            vertices = mesh.vertex_count(),
            triangles = mesh.triangle_count(),
            material = %mesh.material.name,
            "FBX mesh built"
        );
        meshes.push(mesh);
    }

    let model = ModelData { meshes };
    model.validate()?;
    Ok(model)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::super::binary::writer::node;
    use super::*;

    fn layer(name: &str, mapping: &str, reference: &str, values: (&str, Vec<f64>), index: Option<(&str, Vec<i32>)>) -> Node {
        let mut children = vec![
            node("MappingInformationType", vec![Property::String(mapping.into())], vec![]),
            node("ReferenceInformationType", vec![Property::String(reference.into())], vec![]),
            node(values.0, vec![Property::F64Array(values.1)], vec![]),
        ];
        if let Some((index_name, idx)) = index {
            children.push(node(index_name, vec![Property::I32Array(idx)], vec![]));
        }
        node(name, vec![Property::I32(0)], children)
    }

    /// 一个四边形面片：4 个控制点，一个四边形，两个法线方向不同的多边形顶点
    pub fn quad_nodes(texture: &str) -> Vec<Node> {
        let geometry = node(
            "Geometry",
            vec![Property::I64(10), Property::String("Quad\0\x01Geometry".into()), Property::String("Mesh".into())],
            vec![
                node(
                    "Vertices",
                    vec![Property::F64Array(vec![
                        0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0,
                    ])],
                    vec![],
                ),
                node("PolygonVertexIndex", vec![Property::I32Array(vec![0, 1, 2, !3])], vec![]),
                layer(
                    "LayerElementNormal",
                    "ByPolygonVertex",
                    "Direct",
                    ("Normals", vec![0.0, 0.0, -1.0, 0.0, 0.0, -1.0, 0.0, 0.0, -1.0, 0.0, 0.0, -1.0]),
                    None,
                ),
                {
                    let mut uv = layer(
                        "LayerElementUV",
                        "ByPolygonVertex",
                        "IndexToDirect",
                        ("UV", vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]),
                        Some(("UVIndex", vec![0, 1, 2, 3])),
                    );
                    uv.children.push(node("Name", vec![Property::String("map1".into())], vec![]));
                    uv
                },
            ],
        );
        let model = node(
            "Model",
            vec![Property::I64(20), Property::String("Quad\0\x01Model".into()), Property::String("Mesh".into())],
            vec![],
        );
        let material = node(
            "Material",
            vec![Property::I64(30), Property::String("Red\0\x01Material".into()), Property::String("".into())],
            vec![node(
                "Properties70",
                vec![],
                vec![node(
                    "P",
                    vec![
                        Property::String("DiffuseColor".into()),
                        Property::String("Color".into()),
                        Property::String("".into()),
                        Property::String("A".into()),
                        Property::F64(1.0),
                        Property::F64(0.0),
                        Property::F64(0.0),
                    ],
                    vec![],
                )],
            )],
        );
        let texture_node = node(
            "Texture",
            vec![Property::I64(40), Property::String("Tex\0\x01Texture".into()), Property::String("".into())],
            vec![node("RelativeFilename", vec![Property::String(texture.into())], vec![])],
        );

        let c = |kind: &str, child: i64, parent: i64, prop: Option<&str>| {
            let mut props = vec![Property::String(kind.into()), Property::I64(child), Property::I64(parent)];
            if let Some(p) = prop {
                props.push(Property::String(p.into()));
            }
            node("C", props, vec![])
        };

        vec![
            node("Objects", vec![], vec![geometry, model, material, texture_node]),
            node(
                "Connections",
                vec![],
                vec![
                    c("OO", 10, 20, None),
                    c("OO", 20, 0, None),
                    c("OO", 30, 20, None),
                    c("OP", 40, 30, Some("DiffuseColor")),
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::super::binary::writer::{node, write};
    use super::super::binary::parse;
    use super::*;

    #[test]
    fn test_polygon_decoding() {
        let polys = polygons(&[0, 1, !2, 2, 3, 4, !5]).unwrap();
        assert_eq!(polys, vec![vec![0, 1, 2], vec![2, 3, 4, 5]]);
        assert!(polygons(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_quad_is_fan_triangulated_with_material() {
        let doc = parse(&write(7400, &fixtures::quad_nodes("red.dds"), false)).unwrap();
        let model = build_model(&doc).unwrap();
        assert_eq!(model.meshes.len(), 1);

        let mesh = &model.meshes[0];
        assert_eq!(mesh.name.as_deref(), Some("Quad"));
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[2].texcoord, [1.0, 1.0]);
        assert_eq!(mesh.vertices[3].normal, [0.0, 0.0, -1.0]);
        assert_eq!(mesh.material.name, "Red");
        assert_eq!(mesh.material.diffuse, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.material.texture, Some(PathBuf::from("red.dds")));
    }

    #[test]
    fn test_shared_control_point_normals_are_averaged() {
        // 两个三角形共享控制点 0，法线分别为 +X 和 +Y
        let geometry = node(
            "Geometry",
            vec![Property::I64(1), Property::String("G\0\x01Geometry".into()), Property::String("Mesh".into())],
            vec![
                node("Vertices", vec![Property::F64Array(vec![0.0; 12])], vec![]),
                node("PolygonVertexIndex", vec![Property::I32Array(vec![0, 1, !2, 0, 2, !3])], vec![]),
                node(
                    "LayerElementNormal",
                    vec![Property::I32(0)],
                    vec![
                        node("MappingInformationType", vec![Property::String("ByPolygonVertex".into())], vec![]),
                        node("ReferenceInformationType", vec![Property::String("IndexToDirect".into())], vec![]),
                        node("Normals", vec![Property::F64Array(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0])], vec![]),
                        node("NormalsIndex", vec![Property::I32Array(vec![0, 0, 0, 1, 1, 1])], vec![]),
                    ],
                ),
            ],
        );
        let model = node(
            "Model",
            vec![Property::I64(2), Property::String("M\0\x01Model".into()), Property::String("Mesh".into())],
            vec![],
        );
        let nodes = vec![
            node("Objects", vec![], vec![geometry, model]),
            node(
                "Connections",
                vec![],
                vec![node("C", vec![Property::String("OO".into()), Property::I64(1), Property::I64(2)], vec![])],
            ),
        ];

        let model = build_model(&parse(&write(7500, &nodes, true)).unwrap()).unwrap();
        let mesh = &model.meshes[0];
        let n = mesh.vertices[0].normal;
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((n[0] - expected).abs() < 1e-5 && (n[1] - expected).abs() < 1e-5);
        assert_eq!(mesh.vertices[1].normal, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[3].normal, [0.0, 1.0, 0.0]);
        assert_eq!(mesh.material, Material::default());
    }

    #[test]
    fn test_missing_objects_section() {
        let doc = parse(&write(7400, &[node("Connections", vec![], vec![])], false)).unwrap();
        assert!(build_model(&doc).is_err());
    }
}
