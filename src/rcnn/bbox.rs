use ndarray::{Array2, ArrayView2};

/// bbox_overlaps: IoU between every box and every query box
///
/// Coordinates are 0-based inclusive pixel extents, so widths and heights
/// carry a `+ 1`.
///
/// * `boxes` - n * 4 region proposals.
/// * `query_boxes` - k * 4 reference boxes, usually ground truth.
/// * `return` - overlaps n * k.
pub fn bbox_overlaps(boxes: ArrayView2<f32>, query_boxes: ArrayView2<f32>) -> Array2<f32> {
    let n = boxes.nrows();
    let k = query_boxes.nrows();
    let mut overlaps = Array2::<f32>::zeros((n, k));

    for k_idx in 0..k {
        let query = query_boxes.row(k_idx);
        let query_area = (query[2] - query[0] + 1.0) * (query[3] - query[1] + 1.0);

        for n_idx in 0..n {
            let bbox = boxes.row(n_idx);
            let iw = bbox[2].min(query[2]) - bbox[0].max(query[0]) + 1.0;
            if iw <= 0.0 {
                continue;
            }
            let ih = bbox[3].min(query[3]) - bbox[1].max(query[1]) + 1.0;
            if ih <= 0.0 {
                continue;
            }
            let box_area = (bbox[2] - bbox[0] + 1.0) * (bbox[3] - bbox[1] + 1.0);
            let intersection = iw * ih;
            overlaps[(n_idx, k_idx)] = intersection / (box_area + query_area - intersection);
        }
    }
    overlaps
}
