//! End-to-end properties of the generation pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use noise::{NoiseFn, Simplex};
use strata_terrain::seed::{derive_stage_seed, noise_seed};
use strata_terrain::{
    CancelToken, Diagnostic, Extent, GenerationOrchestrator, GenerationOutcome, GenerationRequest,
    GenerationResult, GenerationState, GridPos, HeightmapBuilder, HeightmapConfig, HeightmapGrid,
    HydrologyConfig, HydrologyRouter, ObjectRule, OctaveConfig, OrchestratorConfig,
    PlacedObject, PoiCategory, ProgressListener, ProgressUpdate, ResourceInput, Stage,
    StageContext, StageTag, verify_separation,
};

fn request(seed: u64, size: u32) -> GenerationRequest {
    let mut request = GenerationRequest::default()
        .with_seed(seed)
        .with_extent(size, size);
    request.heightmap.falloff_width = 8;
    request.poi.poi_count = 5;
    request.poi.min_poi_separation = 12.0;
    request.region_size = 32;
    request
}

fn generate(orchestrator: &GenerationOrchestrator, request: GenerationRequest) -> GenerationResult {
    match orchestrator.run_blocking(request).unwrap() {
        GenerationOutcome::Completed(result) => *result,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

#[test]
fn test_same_request_gives_equal_results() {
    let orchestrator = GenerationOrchestrator::default();
    let a = generate(&orchestrator, request(42, 96));
    let b = generate(&orchestrator, request(42, 96));
    assert_eq!(a.elevation_fingerprint(), b.elevation_fingerprint());
    assert_eq!(a, b, "Two runs of one request must agree in every output");
}

#[test]
fn test_thread_count_does_not_change_output() {
    let single = GenerationOrchestrator::new(OrchestratorConfig {
        worker_threads: 1,
        stage_workers: 1,
    });
    let parallel = GenerationOrchestrator::new(OrchestratorConfig {
        worker_threads: 4,
        stage_workers: 3,
    });
    let a = generate(&single, request(9, 96));
    let b = generate(&parallel, request(9, 96));
    assert_eq!(a, b, "Single-threaded and parallel pools must agree");
}

fn build_heightmap(seed: u64, extent: Extent) -> HeightmapGrid {
    HeightmapBuilder::new(
        seed,
        extent,
        (0, 0),
        1.0,
        OctaveConfig::default(),
        HeightmapConfig::default(),
    )
    .unwrap()
    .build(&StageContext::detached())
    .unwrap()
}

/// Default elevation pipeline written out longhand: four simplex octaves
/// (frequency 0.01, lacunarity 2, persistence 0.5), mapped to [0, 1], raised
/// to the power 1.3, then blended toward 0.35 over a 16-cell edge band.
fn reference_elevation(noise: &Simplex, extent: Extent, x: u32, y: u32) -> f64 {
    let mut total = 0.0;
    let mut frequency = 0.01;
    let mut amplitude = 1.0;
    for _ in 0..4 {
        total += noise.get([x as f64 * frequency, y as f64 * frequency]) * amplitude;
        frequency *= 2.0;
        amplitude *= 0.5;
    }
    let fbm = (total / 1.875).clamp(-1.0, 1.0);
    let raw = ((fbm + 1.0) * 0.5).clamp(0.0, 1.0).powf(1.3);

    let edge = x.min(y).min(extent.width - 1 - x).min(extent.height - 1 - y);
    let t = (edge as f64 / 16.0).clamp(0.0, 1.0);
    let t = t * t * (3.0 - 2.0 * t);
    if t >= 1.0 { raw } else { 0.35 * (1.0 - t) + raw * t }
}

#[test]
fn test_seeded_edge_matches_base_elevation() {
    let extent = Extent::new(256, 256);
    let a = build_heightmap(42, extent);
    assert_eq!(a.elevation(GridPos::new(0, 0)), 0.35);
    assert_eq!(a.elevation(GridPos::new(0, 0)), HeightmapConfig::default().base_elevation);

    let b = build_heightmap(43, extent);
    let differing = a
        .elevations()
        .iter()
        .zip(b.elevations())
        .filter(|(x, y)| x != y)
        .count();
    assert!(differing > 0, "Seeds 42 and 43 must differ in at least one cell");
}

#[test]
fn test_seed_42_matches_longhand_pipeline() {
    let extent = Extent::new(256, 256);
    let heightmap = build_heightmap(42, extent);

    // The elevation field's noise seed is pinned; a change here reshuffles
    // every world.
    let stage_seed = derive_stage_seed(42, StageTag::Elevation);
    assert_eq!(stage_seed, 0xdaa4_494c_cdae_2349);
    let noise = Simplex::new(noise_seed(stage_seed));

    for y in 0..extent.height {
        for x in 0..extent.width {
            let expected = reference_elevation(&noise, extent, x, y);
            let actual = heightmap.elevation(GridPos::new(x, y));
            assert!(
                (actual - expected).abs() < 1e-12,
                "Cell ({x}, {y}): built {actual}, expected {expected}"
            );
        }
    }

    let centre = heightmap.elevation(GridPos::new(128, 128));
    assert_ne!(centre, 0.35, "Interior cells must carry noise, not the base elevation");
    let (lo, hi) = heightmap.range();
    assert!(hi - lo > 0.1, "Seed 42 should produce relief, got range [{lo}, {hi}]");
}

#[test]
fn test_flat_map_with_pit_has_one_lake() {
    let extent = Extent::new(64, 64);
    let centre = GridPos::new(32, 32);
    let mut elevations = vec![0.5; extent.cell_count()];
    elevations[extent.index(centre)] = 0.2;
    let heightmap = HeightmapGrid::from_elevations(extent, elevations, 1.0, 100.0).unwrap();

    // Only the pit's eight neighbours drain into it.
    let config = HydrologyConfig {
        lake_pooling_threshold: 4,
        ..Default::default()
    };
    let graph = HydrologyRouter::new(config)
        .route(&heightmap, &StageContext::detached())
        .unwrap();
    assert_eq!(graph.lakes.len(), 1, "Exactly one lake expected");
    assert!(graph.lakes[0].cells.contains(&centre));
    assert!(graph.is_lake(centre));
    assert!(graph.verify_termination(&heightmap).is_ok());
}

#[test]
fn test_rivers_terminate_in_generated_world() {
    let result = generate(&GenerationOrchestrator::default(), request(5, 128));
    result
        .hydrology
        .verify_termination(&result.heightmap)
        .unwrap_or_else(|e| panic!("river does not terminate: {e}"));
}

#[test]
fn test_placement_radius_five_keeps_separation() {
    let mut request = request(77, 100);
    let rule = ObjectRule {
        object: "boulder".into(),
        density: 1.0,
        separation_radius: 5.0,
        max_slope: 90.0,
        ..Default::default()
    };
    let land = [
        "beach",
        "snow",
        "mountain",
        "tundra",
        "taiga",
        "desert",
        "savanna",
        "rainforest",
        "swamp",
        "forest",
        "grassland",
    ];
    request.placement.placement_density_by_biome = land
        .iter()
        .map(|biome| (biome.to_string(), vec![rule.clone()]))
        .collect::<BTreeMap<_, _>>();
    request.placement.max_attempts = None;

    let result = generate(&GenerationOrchestrator::default(), request);
    assert!(!result.placements.objects.is_empty(), "Land should receive objects");
    verify_separation(&result.placements.objects).unwrap();

    let objects = &result.placements.objects;
    for (i, a) in objects.iter().enumerate() {
        for b in &objects[i + 1..] {
            let dx = a.position.x as f64 - b.position.x as f64;
            let dy = a.position.y as f64 - b.position.y as f64;
            assert!(
                (dx * dx + dy * dy).sqrt() >= 5.0,
                "Objects at {:?} and {:?} are too close",
                a.position,
                b.position
            );
        }
    }
}

#[test]
fn test_roads_connect_or_report_unreachable() {
    for seed in [1, 2, 3] {
        let result = generate(&GenerationOrchestrator::default(), request(seed, 128));
        let roads = &result.roads;
        if roads.is_fully_connected() {
            assert_eq!(roads.components().len(), 1, "seed {seed}: network should be one component");
        } else {
            let reported = result.diagnostics.iter().any(|d| {
                matches!(d, Diagnostic::RoadNetworkDisconnected { unreachable } if *unreachable == roads.unreachable)
            });
            assert!(reported, "seed {seed}: unreachable POIs must be reported");
        }
    }
}

#[test]
fn test_caves_reachable_from_entrances() {
    let mut request = request(21, 128);
    request.caves.cave_entrance_density = 0.002;
    let result = generate(&GenerationOrchestrator::default(), request);
    result
        .caves
        .verify_connectivity()
        .unwrap_or_else(|e| panic!("cave network disconnected: {e}"));
    for &entrance in &result.caves.entrances {
        assert!(result.caves.nodes[entrance as usize].is_entrance);
    }
}

#[test]
fn test_cancellation_ends_in_cancelled_state() {
    let orchestrator = GenerationOrchestrator::default();
    let handle = orchestrator.submit(request(3, 512)).unwrap();
    handle.cancel();
    let outcome = handle.wait();
    assert_eq!(outcome, GenerationOutcome::Cancelled);
    assert_eq!(outcome.state(), GenerationState::Cancelled);
    assert!(outcome.result().is_none(), "A cancelled run exposes no stage data");
}

/// Cancels the run as soon as the POI stage reports completion.
struct CancelAfterPoi {
    token: CancelToken,
    started: Mutex<Vec<Stage>>,
    finished: Mutex<Option<GenerationOutcome>>,
}

impl ProgressListener for CancelAfterPoi {
    fn on_progress(&self, update: ProgressUpdate) {
        if update.fraction == 0.0 {
            self.started.lock().unwrap().push(update.stage);
        }
        if update.stage == Stage::Poi && update.fraction >= 1.0 {
            self.token.cancel();
        }
    }

    fn on_finished(&self, outcome: &GenerationOutcome) {
        *self.finished.lock().unwrap() = Some(outcome.clone());
    }
}

#[test]
fn test_cancel_between_stages_stops_the_pipeline() {
    let token = CancelToken::new();
    let listener = Arc::new(CancelAfterPoi {
        token: token.clone(),
        started: Mutex::new(Vec::new()),
        finished: Mutex::new(None),
    });
    let orchestrator = GenerationOrchestrator::default().with_listener(listener.clone());
    let handle = orchestrator.submit_with_cancel(request(42, 96), token).unwrap();
    let outcome = handle.wait();

    assert_eq!(outcome, GenerationOutcome::Cancelled);
    assert!(outcome.result().is_none(), "A cancelled run publishes no result");
    assert_eq!(*listener.finished.lock().unwrap(), Some(GenerationOutcome::Cancelled));

    let started = listener.started.lock().unwrap();
    assert!(started.contains(&Stage::Poi), "POI stage should have run");
    for later in [Stage::Roads, Stage::Placement] {
        assert!(!started.contains(&later), "{later:?} started after cancellation");
    }
}

#[test]
fn test_resource_nodes_sit_on_eligible_cells() {
    let request = request(5, 128);
    let table = request.biome_rules.compile().unwrap();
    let resources = request.resources.compile(&table).unwrap();
    let result = generate(&GenerationOrchestrator::default(), request);
    assert!(!result.resources.nodes.is_empty(), "Default table should yield some nodes");

    let world = ResourceInput {
        heightmap: &result.heightmap,
        biomes: &result.biomes,
        hydrology: &result.hydrology,
    };
    for node in &result.resources.nodes {
        assert!(
            !result.hydrology.is_water(node.position),
            "Resource node at {:?} is in a river or lake",
            node.position
        );
        assert!(
            !table.def(result.biomes.biome(node.position)).is_water,
            "Resource node at {:?} is in a water biome",
            node.position
        );
        assert!(
            resources.is_eligible(node.resource as usize, &world, node.position),
            "Resource node at {:?} fails its rule's biome or elevation filter",
            node.position
        );
    }
}

#[test]
fn test_structure_groups_surround_settlements() {
    let request = request(5, 128);
    let rule = request
        .placement
        .structure_groups
        .iter()
        .find(|g| g.category == PoiCategory::Settlement)
        .cloned()
        .unwrap();
    let result = generate(&GenerationOrchestrator::default(), request);
    let placements = &result.placements;
    assert!(!placements.structures.is_empty(), "Settlements should get structure groups");

    let mut members = 0;
    for group in &placements.structures {
        let poi = result.pois.records.iter().find(|p| p.id == group.poi).unwrap();
        assert_eq!(poi.category, group.category);
        for member in &group.members {
            members += 1;
            assert!(member.position.distance(poi.position) <= rule.cluster_radius + 1.0);
            assert!(!result.hydrology.is_water(member.position));
        }
    }
    assert!(members > 0, "No structure was placed around any POI");
    let everything: Vec<PlacedObject> = placements.all_placed().cloned().collect();
    verify_separation(&everything).unwrap();
}

#[test]
fn test_cancelled_token_stops_a_stage() {
    let token = CancelToken::new();
    token.cancel();
    let ctx = StageContext::new(token, Arc::new(|_fraction: f32| {}));
    let built = HeightmapBuilder::new(
        1,
        Extent::new(64, 64),
        (0, 0),
        1.0,
        OctaveConfig::default(),
        HeightmapConfig::default(),
    )
    .unwrap()
    .build(&ctx);
    assert!(built.is_err(), "A cancelled context must abort the stage");
}

#[test]
fn test_adjacent_requests_share_an_edge_profile() {
    let mut left = request(8, 64);
    left.heightmap.falloff_width = 0;
    let mut right = left.clone();
    right.origin = (63, 0);

    let orchestrator = GenerationOrchestrator::default();
    let a = generate(&orchestrator, left);
    let b = generate(&orchestrator, right);
    for y in 0..64 {
        assert_eq!(
            a.heightmap.elevation(GridPos::new(63, y)),
            b.heightmap.elevation(GridPos::new(0, y)),
            "Shared column must match at row {y}"
        );
    }
}
